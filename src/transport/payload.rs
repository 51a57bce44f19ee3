//! Measurement-protocol serialization
//!
//! One hit becomes one url-encoded line; a batch is lines joined by `\n`.

use chrono::{DateTime, Utc};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::form_urlencoded;

use crate::config::TransportConfig;
use crate::models::{Hit, Param, QueuedHit};
use crate::transport::BatchRequest;

pub const PROTOCOL_VERSION: &str = "1";

#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_hits: usize,
    pub max_batch_bytes: usize,
    pub max_hit_bytes: usize,
}

impl From<&TransportConfig> for BatchLimits {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_hits: config.max_batch_hits.max(1),
            max_batch_bytes: config.max_batch_bytes,
            max_hit_bytes: config.max_hit_bytes,
        }
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

/// A batch ready for submission plus the queue ids it covers
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub request: BatchRequest,
    /// Queue ids of `request.lines`, index for index
    pub ids: Vec<i64>,
    /// Hits too large to ever be accepted
    pub oversized: Vec<i64>,
}

impl EncodedBatch {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Zeroes the host part of an address: the last octet for IPv4, everything
/// past the first 48 bits for IPv6.
pub fn anonymize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(addr) => {
            let octets = addr.octets();
            IpAddr::V4(Ipv4Addr::new(octets[0], octets[1], octets[2], 0))
        }
        IpAddr::V6(addr) => {
            let segments = addr.segments();
            IpAddr::V6(Ipv6Addr::new(
                segments[0],
                segments[1],
                segments[2],
                0,
                0,
                0,
                0,
                0,
            ))
        }
    }
}

/// Serializes one hit. `now` is the submission time used for `qt`.
pub fn encode_hit(hit: &Hit, now: DateTime<Utc>) -> String {
    let mut line = form_urlencoded::Serializer::new(String::new());
    line.append_pair("v", PROTOCOL_VERSION);
    line.append_pair("tid", &hit.tracking_id);
    line.append_pair("cid", &hit.client_id);
    line.append_pair("t", hit.hit_type.as_str());

    let anonymize = hit.is_anonymized();
    for (param, value) in &hit.parameters {
        if param.is_local() {
            continue;
        }
        if *param == Param::IpOverride && anonymize {
            match value.parse::<IpAddr>() {
                Ok(ip) => {
                    line.append_pair(param.wire_key(), &anonymize_ip(ip).to_string());
                }
                // An unparseable override cannot be masked, so it is not sent
                Err(_) => continue,
            }
            continue;
        }
        line.append_pair(param.wire_key(), value);
    }

    if hit.session_start {
        line.append_pair("sc", "start");
    }
    for (index, value) in &hit.custom_dimensions {
        line.append_pair(&format!("cd{index}"), value);
    }
    for (index, value) in &hit.custom_metrics {
        line.append_pair(&format!("cm{index}"), &value.to_string());
    }

    let queue_time = (now - hit.timestamp).num_milliseconds().max(0);
    line.append_pair("qt", &queue_time.to_string());

    line.finish()
}

/// Takes the longest prefix of `hits` that fits the limits and shares the
/// first hit's scheme. Oversized hits inside that prefix are set aside.
pub fn build_batch(hits: &[QueuedHit], now: DateTime<Utc>, limits: &BatchLimits) -> EncodedBatch {
    let use_https = hits.first().map_or(true, |q| q.hit.use_https);
    let mut lines = Vec::new();
    let mut ids = Vec::new();
    let mut oversized = Vec::new();
    let mut body_len = 0usize;

    for queued in hits {
        if queued.hit.use_https != use_https || ids.len() >= limits.max_hits {
            break;
        }

        let line = encode_hit(&queued.hit, now);
        if line.len() > limits.max_hit_bytes {
            oversized.push(queued.id);
            continue;
        }

        let added = if lines.is_empty() { line.len() } else { line.len() + 1 };
        if !lines.is_empty() && body_len + added > limits.max_batch_bytes {
            break;
        }

        body_len += added;
        lines.push(line);
        ids.push(queued.id);
    }

    EncodedBatch {
        request: BatchRequest { use_https, lines },
        ids,
        oversized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::HitType;
    use chrono::Duration;
    use std::collections::{BTreeMap, HashMap};

    fn hit(params: &[(Param, &str)]) -> Hit {
        Hit {
            tracking_id: "UA-1-1".to_string(),
            client_id: "abc".to_string(),
            hit_type: HitType::Event,
            timestamp: Utc::now(),
            session_start: false,
            use_https: true,
            parameters: params.iter().map(|(p, v)| (*p, v.to_string())).collect(),
            custom_dimensions: BTreeMap::new(),
            custom_metrics: BTreeMap::new(),
        }
    }

    fn fields(line: &str) -> HashMap<String, String> {
        form_urlencoded::parse(line.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_encode_hit_fields() {
        let mut h = hit(&[
            (Param::EventCategory, "ui"),
            (Param::EventAction, "tap & hold"),
        ]);
        h.session_start = true;
        h.custom_dimensions.insert(2, "blue".to_string());
        h.custom_metrics.insert(5, 7);
        let now = h.timestamp + Duration::milliseconds(1500);

        let f = fields(&encode_hit(&h, now));
        assert_eq!(f["v"], "1");
        assert_eq!(f["tid"], "UA-1-1");
        assert_eq!(f["cid"], "abc");
        assert_eq!(f["t"], "event");
        assert_eq!(f["ea"], "tap & hold");
        assert_eq!(f["sc"], "start");
        assert_eq!(f["cd2"], "blue");
        assert_eq!(f["cm5"], "7");
        assert_eq!(f["qt"], "1500");
    }

    #[test]
    fn test_queue_time_never_negative() {
        let h = hit(&[]);
        let f = fields(&encode_hit(&h, h.timestamp - Duration::seconds(3)));
        assert_eq!(f["qt"], "0");
    }

    #[test]
    fn test_ip_override_masked_when_anonymized() {
        let h = hit(&[(Param::Anonymize, "1"), (Param::IpOverride, "203.0.113.77")]);
        let f = fields(&encode_hit(&h, h.timestamp));
        assert_eq!(f["aip"], "1");
        assert_eq!(f["uip"], "203.0.113.0");

        let h = hit(&[(Param::IpOverride, "203.0.113.77")]);
        let f = fields(&encode_hit(&h, h.timestamp));
        assert_eq!(f["uip"], "203.0.113.77");
        assert!(!f.contains_key("aip"));
    }

    #[test]
    fn test_anonymize_ip() {
        let ip: IpAddr = "192.168.1.100".parse().unwrap();
        assert_eq!(anonymize_ip(ip), "192.168.1.0".parse::<IpAddr>().unwrap());
        let ip: IpAddr = "2001:db8::1234:5678".parse().unwrap();
        assert_eq!(anonymize_ip(ip), "2001:db8::".parse::<IpAddr>().unwrap());
    }

    fn queued(id: i64, h: Hit) -> QueuedHit {
        QueuedHit { id, hit: h }
    }

    #[test]
    fn test_batch_respects_hit_count() {
        let hits: Vec<_> = (0..5).map(|i| queued(i, hit(&[]))).collect();
        let limits = BatchLimits {
            max_hits: 3,
            ..BatchLimits::default()
        };
        let batch = build_batch(&hits, Utc::now(), &limits);
        assert_eq!(batch.ids, vec![0, 1, 2]);
        assert_eq!(batch.request.lines.len(), 3);
    }

    #[test]
    fn test_batch_stops_at_scheme_change() {
        let mut plain = hit(&[]);
        plain.use_https = false;
        let hits = vec![queued(1, hit(&[])), queued(2, plain), queued(3, hit(&[]))];
        let batch = build_batch(&hits, Utc::now(), &BatchLimits::default());
        assert!(batch.request.use_https);
        assert_eq!(batch.ids, vec![1]);
    }

    #[test]
    fn test_batch_byte_ceiling_and_oversized_hits() {
        let big = "x".repeat(600);
        let hits = vec![
            queued(1, hit(&[(Param::EventLabel, &big)])),
            queued(2, hit(&[(Param::EventLabel, &"y".repeat(2000))])),
            queued(3, hit(&[(Param::EventLabel, &big)])),
            queued(4, hit(&[(Param::EventLabel, &big)])),
        ];
        let limits = BatchLimits {
            max_hits: 20,
            max_batch_bytes: 1500,
            max_hit_bytes: 1000,
        };
        let batch = build_batch(&hits, Utc::now(), &limits);
        assert_eq!(batch.oversized, vec![2]);
        assert_eq!(batch.ids, vec![1, 3]);
        assert!(batch.request.body().len() <= 1500);
    }
}
