//! Known protocol parameters
//!
//! The tracker's `set`/`get` surface is string keyed for callers, but every
//! name resolves to one of these variants before anything is stored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("unknown parameter '{0}'")]
    Unknown(String),
    #[error("invalid value '{value}' for parameter '{name}'")]
    InvalidValue { name: &'static str, value: String },
    #[error("unknown hit type '{0}'")]
    UnknownHitType(String),
    #[error("custom index {0} is out of range (1..=200)")]
    IndexOutOfRange(u32),
}

macro_rules! params {
    ($($variant:ident => $wire:literal, $name:literal;)*) => {
        /// A protocol field, serialized by its wire key
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum Param {
            $(
                #[serde(rename = $wire)]
                $variant,
            )*
        }

        impl Param {
            pub const ALL: &'static [Param] = &[$(Param::$variant,)*];

            /// Key used on the wire
            pub fn wire_key(self) -> &'static str {
                match self {
                    $(Param::$variant => $wire,)*
                }
            }

            /// Descriptive name accepted by `Tracker::set`
            pub fn name(self) -> &'static str {
                match self {
                    $(Param::$variant => $name,)*
                }
            }
        }
    };
}

params! {
    AppName => "an", "appName";
    AppId => "aid", "appId";
    AppVersion => "av", "appVersion";
    Anonymize => "aip", "anonymize";
    SampleRate => "sf", "sampleRate";
    ScreenName => "cd", "appScreen";
    ReferrerUrl => "dr", "referrerUrl";
    CampaignUrl => "cu_url", "campaignUrl";
    CampaignName => "cn", "campaignName";
    CampaignSource => "cs", "campaignSource";
    CampaignMedium => "cm", "campaignMedium";
    CampaignKeyword => "ck", "campaignKeyword";
    CampaignContent => "cc", "campaignContent";
    AdwordsId => "gclid", "adwordsId";
    UserId => "uid", "userId";
    IpOverride => "uip", "ipOverride";
    UserAgentOverride => "ua", "userAgent";
    Language => "ul", "language";
    ScreenResolution => "sr", "screenResolution";
    NonInteraction => "ni", "nonInteraction";
    EventCategory => "ec", "eventCategory";
    EventAction => "ea", "eventAction";
    EventLabel => "el", "eventLabel";
    EventValue => "ev", "eventValue";
    TimingCategory => "utc", "timingCategory";
    TimingVar => "utv", "timingVar";
    TimingValue => "utt", "timingValue";
    TimingLabel => "utl", "timingLabel";
    ExceptionDescription => "exd", "exDescription";
    ExceptionFatal => "exf", "exFatal";
    SocialNetwork => "sn", "socialNetwork";
    SocialAction => "sa", "socialAction";
    SocialTarget => "st", "socialTarget";
    TransactionId => "ti", "transactionId";
    TransactionAffiliation => "ta", "affiliation";
    TransactionRevenue => "tr", "revenue";
    TransactionShipping => "ts", "shipping";
    TransactionTax => "tt", "tax";
    CurrencyCode => "cu", "currencyCode";
    ItemName => "in", "itemName";
    ItemPrice => "ip", "itemPrice";
    ItemQuantity => "iq", "itemQuantity";
    ItemSku => "ic", "itemSku";
    ItemCategory => "iv", "itemCategory";
}

impl Param {
    /// Attached to one hit and then cleared from the tracker defaults
    pub fn is_single_use(self) -> bool {
        matches!(self, Param::ReferrerUrl | Param::CampaignUrl)
    }

    /// Local-only parameters that never go on the wire as-is
    pub fn is_local(self) -> bool {
        matches!(self, Param::CampaignUrl)
    }

    /// Checks and normalizes a value for this parameter.
    pub fn normalize(self, value: &str) -> Result<String, ParamError> {
        let invalid = || ParamError::InvalidValue {
            name: self.name(),
            value: value.to_string(),
        };

        match self {
            Param::Anonymize | Param::NonInteraction | Param::ExceptionFatal => {
                parse_flag(value).map(|b| if b { "1" } else { "0" }.to_string()).ok_or_else(invalid)
            }
            Param::SampleRate => {
                let rate = value.trim().parse::<f64>().map_err(|_| invalid())?;
                if (0.0..=100.0).contains(&rate) {
                    Ok(format_rate(rate))
                } else {
                    Err(invalid())
                }
            }
            Param::EventValue | Param::TimingValue | Param::ItemQuantity => value
                .trim()
                .parse::<i64>()
                .map(|v| v.to_string())
                .map_err(|_| invalid()),
            _ => Ok(value.to_string()),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Param {
    type Err = ParamError;

    /// Accepts the descriptive name, the wire key, or the wire key with a
    /// leading `&`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.strip_prefix('&').unwrap_or(s);
        Param::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(key) || p.wire_key() == key)
            .ok_or_else(|| ParamError::Unknown(s.to_string()))
    }
}

pub(crate) fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn format_rate(rate: f64) -> String {
    if rate.fract() == 0.0 {
        format!("{}", rate as i64)
    } else {
        format!("{rate}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_by_name_and_wire_key() {
        assert_eq!("appScreen".parse::<Param>().unwrap(), Param::ScreenName);
        assert_eq!("cd".parse::<Param>().unwrap(), Param::ScreenName);
        assert_eq!("&ec".parse::<Param>().unwrap(), Param::EventCategory);
        assert_eq!("APPNAME".parse::<Param>().unwrap(), Param::AppName);
    }

    #[test]
    fn test_unknown_parameter() {
        assert_eq!(
            "flux".parse::<Param>(),
            Err(ParamError::Unknown("flux".to_string()))
        );
    }

    #[test]
    fn test_wire_keys_are_unique() {
        let mut keys: Vec<_> = Param::ALL.iter().map(|p| p.wire_key()).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), Param::ALL.len());
    }

    #[test]
    fn test_normalize_typed_slots() {
        assert_eq!(Param::Anonymize.normalize("true").unwrap(), "1");
        assert_eq!(Param::Anonymize.normalize("no").unwrap(), "0");
        assert!(Param::Anonymize.normalize("maybe").is_err());
        assert_eq!(Param::SampleRate.normalize("50").unwrap(), "50");
        assert_eq!(Param::SampleRate.normalize("12.5").unwrap(), "12.5");
        assert!(Param::SampleRate.normalize("101").is_err());
        assert!(Param::EventValue.normalize("ten").is_err());
        assert_eq!(Param::ScreenName.normalize("Home").unwrap(), "Home");
    }

    #[test]
    fn test_single_use_policy() {
        assert!(Param::ReferrerUrl.is_single_use());
        assert!(Param::CampaignUrl.is_single_use());
        assert!(!Param::ScreenName.is_single_use());
    }
}
