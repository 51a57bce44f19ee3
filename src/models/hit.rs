//! Hit records
//!
//! A `Hit` is built once by a tracker and never modified after it is handed
//! to the dispatch worker. The queue assigns it a sequence id on append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::models::param::{Param, ParamError};

/// Highest custom dimension/metric index accepted by the collector
pub const MAX_CUSTOM_INDEX: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitType {
    AppView,
    Event,
    Transaction,
    Item,
    Timing,
    Exception,
    Social,
}

impl HitType {
    /// Value of the `t` field
    pub fn as_str(self) -> &'static str {
        match self {
            HitType::AppView => "appview",
            HitType::Event => "event",
            HitType::Transaction => "transaction",
            HitType::Item => "item",
            HitType::Timing => "timing",
            HitType::Exception => "exception",
            HitType::Social => "social",
        }
    }

    /// Parameters that must be non-empty for a hit of this type to be queued
    pub fn required_params(self) -> &'static [Param] {
        match self {
            HitType::AppView => &[Param::ScreenName],
            HitType::Event => &[Param::EventCategory, Param::EventAction],
            HitType::Transaction => &[Param::TransactionId],
            HitType::Item => &[Param::TransactionId, Param::ItemName],
            HitType::Timing => &[Param::TimingCategory, Param::TimingValue],
            HitType::Exception => &[],
            HitType::Social => &[Param::SocialNetwork, Param::SocialAction],
        }
    }
}

impl fmt::Display for HitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HitType {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "appview" | "screenview" => Ok(HitType::AppView),
            "event" => Ok(HitType::Event),
            "transaction" | "trans" => Ok(HitType::Transaction),
            "item" => Ok(HitType::Item),
            "timing" => Ok(HitType::Timing),
            "exception" => Ok(HitType::Exception),
            "social" => Ok(HitType::Social),
            _ => Err(ParamError::UnknownHitType(s.to_string())),
        }
    }
}

/// One measurement, frozen at enqueue time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub tracking_id: String,
    pub client_id: String,
    pub hit_type: HitType,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    pub session_start: bool,
    /// Submit over https; frozen from the tracker setting
    pub use_https: bool,
    pub parameters: BTreeMap<Param, String>,
    pub custom_dimensions: BTreeMap<u32, String>,
    pub custom_metrics: BTreeMap<u32, i64>,
}

impl Hit {
    pub fn param(&self, param: Param) -> Option<&str> {
        self.parameters.get(&param).map(String::as_str)
    }

    pub fn is_anonymized(&self) -> bool {
        self.param(Param::Anonymize) == Some("1")
    }

    /// Returns the first required parameter that is missing or empty
    pub fn missing_required(&self) -> Option<Param> {
        self.hit_type
            .required_params()
            .iter()
            .copied()
            .find(|p| self.param(*p).map_or(true, |v| v.trim().is_empty()))
    }
}

/// A hit as read back from the persistent queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedHit {
    /// Monotonic insertion sequence number
    pub id: i64,
    pub hit: Hit,
}

pub(crate) fn check_custom_index(index: u32) -> Result<u32, ParamError> {
    if (1..=MAX_CUSTOM_INDEX).contains(&index) {
        Ok(index)
    } else {
        Err(ParamError::IndexOutOfRange(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(hit_type: HitType, params: &[(Param, &str)]) -> Hit {
        Hit {
            tracking_id: "UA-1-1".to_string(),
            client_id: "cid".to_string(),
            hit_type,
            timestamp: Utc::now(),
            session_start: false,
            use_https: true,
            parameters: params
                .iter()
                .map(|(p, v)| (*p, v.to_string()))
                .collect(),
            custom_dimensions: BTreeMap::new(),
            custom_metrics: BTreeMap::new(),
        }
    }

    #[test]
    fn test_hit_type_parse() {
        assert_eq!("appview".parse::<HitType>().unwrap(), HitType::AppView);
        assert_eq!("ScreenView".parse::<HitType>().unwrap(), HitType::AppView);
        assert!("pageview".parse::<HitType>().is_err());
    }

    #[test]
    fn test_missing_required() {
        let view = hit(HitType::AppView, &[]);
        assert_eq!(view.missing_required(), Some(Param::ScreenName));

        let view = hit(HitType::AppView, &[(Param::ScreenName, "  ")]);
        assert_eq!(view.missing_required(), Some(Param::ScreenName));

        let event = hit(
            HitType::Event,
            &[(Param::EventCategory, "ui"), (Param::EventAction, "tap")],
        );
        assert_eq!(event.missing_required(), None);

        assert_eq!(hit(HitType::Exception, &[]).missing_required(), None);
    }

    #[test]
    fn test_hit_json_uses_wire_keys() {
        let view = hit(HitType::AppView, &[(Param::ScreenName, "Home")]);
        let json = serde_json::to_value(&view.parameters).unwrap();
        assert_eq!(json["cd"], "Home");
        assert!(view.custom_dimensions.is_empty());
    }

    #[test]
    fn test_custom_index_bounds() {
        assert!(check_custom_index(0).is_err());
        assert_eq!(check_custom_index(1), Ok(1));
        assert_eq!(check_custom_index(200), Ok(200));
        assert!(check_custom_index(201).is_err());
    }
}
