//! Commerce transaction value objects
//!
//! Amounts are carried in micros (millionths of the currency unit) so no
//! float rounding happens before the collector sees them.

use serde::{Deserialize, Serialize};

use crate::models::param::Param;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub sku: String,
    pub name: String,
    pub category: Option<String>,
    pub price_micros: i64,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub affiliation: Option<String>,
    pub revenue_micros: i64,
    pub tax_micros: i64,
    pub shipping_micros: i64,
    pub currency_code: Option<String>,
    pub items: Vec<TransactionItem>,
}

impl Transaction {
    pub fn new(transaction_id: impl Into<String>, affiliation: Option<&str>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            affiliation: affiliation.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn add_item(&mut self, item: TransactionItem) {
        self.items.push(item);
    }

    /// Fields of the `transaction` hit
    pub fn params(&self) -> Vec<(Param, String)> {
        let mut params = vec![
            (Param::TransactionId, self.transaction_id.clone()),
            (Param::TransactionRevenue, format_micros(self.revenue_micros)),
            (Param::TransactionTax, format_micros(self.tax_micros)),
            (Param::TransactionShipping, format_micros(self.shipping_micros)),
        ];
        if let Some(affiliation) = &self.affiliation {
            params.push((Param::TransactionAffiliation, affiliation.clone()));
        }
        if let Some(currency) = &self.currency_code {
            params.push((Param::CurrencyCode, currency.clone()));
        }
        params
    }

    /// Fields of each `item` hit, in item order
    pub fn item_params(&self) -> Vec<Vec<(Param, String)>> {
        self.items
            .iter()
            .map(|item| {
                let mut params = vec![
                    (Param::TransactionId, self.transaction_id.clone()),
                    (Param::ItemName, item.name.clone()),
                    (Param::ItemSku, item.sku.clone()),
                    (Param::ItemPrice, format_micros(item.price_micros)),
                    (Param::ItemQuantity, item.quantity.to_string()),
                ];
                if let Some(category) = &item.category {
                    params.push((Param::ItemCategory, category.clone()));
                }
                if let Some(currency) = &self.currency_code {
                    params.push((Param::CurrencyCode, currency.clone()));
                }
                params
            })
            .collect()
    }
}

/// Renders micros as a decimal amount without float conversion
pub fn format_micros(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let whole = abs / 1_000_000;
    let frac = abs % 1_000_000;
    if frac == 0 {
        format!("{sign}{whole}")
    } else {
        let digits = format!("{frac:06}");
        format!("{sign}{whole}.{}", digits.trim_end_matches('0'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_micros() {
        assert_eq!(format_micros(0), "0");
        assert_eq!(format_micros(12_340_000), "12.34");
        assert_eq!(format_micros(5_000_000), "5");
        assert_eq!(format_micros(1), "0.000001");
        assert_eq!(format_micros(-2_500_000), "-2.5");
    }

    #[test]
    fn test_transaction_params() {
        let mut tx = Transaction::new("T-100", Some("store"));
        tx.revenue_micros = 19_990_000;
        tx.currency_code = Some("EUR".to_string());
        tx.add_item(TransactionItem {
            sku: "SKU-1".to_string(),
            name: "Sword".to_string(),
            category: None,
            price_micros: 9_995_000,
            quantity: 2,
        });

        let params = tx.params();
        assert!(params.contains(&(Param::TransactionId, "T-100".to_string())));
        assert!(params.contains(&(Param::TransactionRevenue, "19.99".to_string())));
        assert!(params.contains(&(Param::TransactionAffiliation, "store".to_string())));

        let items = tx.item_params();
        assert_eq!(items.len(), 1);
        assert!(items[0].contains(&(Param::ItemPrice, "9.995".to_string())));
        assert!(items[0].contains(&(Param::ItemQuantity, "2".to_string())));
        assert!(items[0].contains(&(Param::CurrencyCode, "EUR".to_string())));
    }
}
