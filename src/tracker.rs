//! Public tracking API
//!
//! Every `send_*` call does its work on the calling thread only as far as
//! validation, sampling and session stamping; the finished hit is handed to
//! the dispatch worker with a non-blocking channel send. The returned `bool`
//! says whether the worker accepted the hit, not whether it was written to
//! the queue database or delivered. Write and delivery failures arrive later
//! as reports on `Analytics::subscribe_errors`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::dispatch::worker::Command;
use crate::models::hit::check_custom_index;
use crate::models::param::{format_rate, parse_flag};
use crate::models::{Hit, HitType, Param, ParamError, Transaction};
use crate::registry::Runtime;
use crate::sampler;
use crate::session::SessionTracker;

pub(crate) type TrackerMap = DashMap<String, Arc<Tracker>>;

/// Mutable tracker defaults and session, guarded together so hits of one
/// tracker reach the worker in the order their fields were captured
#[derive(Debug)]
struct TrackerState {
    /// String-valued protocol defaults
    params: BTreeMap<Param, String>,
    anonymize: bool,
    use_https: bool,
    sample_rate: f64,
    custom_dimensions: BTreeMap<u32, String>,
    custom_metrics: BTreeMap<u32, i64>,
    session: SessionTracker,
}

impl TrackerState {
    fn get(&self, param: Param) -> Option<String> {
        match param {
            Param::Anonymize => Some(if self.anonymize { "1" } else { "0" }.to_string()),
            Param::SampleRate => Some(format_rate(self.sample_rate)),
            _ => self.params.get(&param).cloned(),
        }
    }

    fn set(&mut self, param: Param, value: Option<&str>) -> Result<(), ParamError> {
        let Some(value) = value else {
            match param {
                Param::Anonymize => self.anonymize = false,
                Param::SampleRate => self.sample_rate = 100.0,
                _ => {
                    self.params.remove(&param);
                }
            }
            return Ok(());
        };

        let value = param.normalize(value)?;
        match param {
            Param::Anonymize => self.anonymize = parse_flag(&value).unwrap_or(false),
            Param::SampleRate => self.sample_rate = value.parse().unwrap_or(100.0),
            _ => {
                self.params.insert(param, value);
            }
        }
        Ok(())
    }

    /// Tracker defaults overlaid by call-specific fields
    fn merged_params(&self, call: Vec<(Param, String)>) -> BTreeMap<Param, String> {
        let mut parameters = self.params.clone();
        if self.anonymize {
            parameters.insert(Param::Anonymize, "1".to_string());
        }
        if self.sample_rate < 100.0 {
            parameters.insert(Param::SampleRate, format_rate(self.sample_rate));
        }
        parameters.extend(call);

        if let Some(campaign_url) = parameters.remove(&Param::CampaignUrl) {
            for (param, value) in campaign_params(&campaign_url) {
                parameters.entry(param).or_insert(value);
            }
        }
        parameters.retain(|_, v| !v.is_empty());
        parameters
    }
}

/// Expands `utm_*` and `gclid` query fields of a campaign URL
pub fn campaign_params(campaign_url: &str) -> Vec<(Param, String)> {
    let without_fragment = campaign_url.split('#').next().unwrap_or_default();
    let query = without_fragment
        .split_once('?')
        .map_or(without_fragment, |(_, query)| query);

    form_urlencoded::parse(query.as_bytes())
        .filter_map(|(key, value)| {
            let param = match key.as_ref() {
                "utm_source" => Param::CampaignSource,
                "utm_medium" => Param::CampaignMedium,
                "utm_campaign" => Param::CampaignName,
                "utm_term" => Param::CampaignKeyword,
                "utm_content" => Param::CampaignContent,
                "gclid" => Param::AdwordsId,
                _ => return None,
            };
            Some((param, value.into_owned()))
        })
        .collect()
}

pub struct Tracker {
    tracking_id: String,
    runtime: Arc<Runtime>,
    registry: Weak<TrackerMap>,
    state: Mutex<TrackerState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("tracking_id", &self.tracking_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Tracker {
    pub(crate) fn new(
        tracking_id: String,
        runtime: Arc<Runtime>,
        registry: Weak<TrackerMap>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            tracking_id,
            runtime,
            registry,
            state: Mutex::new(TrackerState {
                params: BTreeMap::new(),
                anonymize: false,
                use_https: true,
                sample_rate: 100.0,
                custom_dimensions: BTreeMap::new(),
                custom_metrics: BTreeMap::new(),
                session: SessionTracker::new(session_timeout),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    /// Stable per-installation identifier
    pub fn client_id(&self) -> &str {
        &self.runtime.client_id
    }

    // Parameters

    /// Sets a parameter by descriptive name or wire key; `None` clears it.
    pub fn set(&self, name: &str, value: Option<&str>) -> Result<(), ParamError> {
        let param = name.parse::<Param>()?;
        self.set_param(param, value)
    }

    /// Current value of a parameter, `None` when unset or unknown
    pub fn get(&self, name: &str) -> Option<String> {
        name.parse::<Param>().ok().and_then(|p| self.param(p))
    }

    pub fn set_param(&self, param: Param, value: Option<&str>) -> Result<(), ParamError> {
        self.state.lock().set(param, value)
    }

    pub fn param(&self, param: Param) -> Option<String> {
        self.state.lock().get(param)
    }

    pub fn set_app_name(&self, name: &str) {
        self.state.lock().params.insert(Param::AppName, name.to_string());
    }

    pub fn set_app_id(&self, app_id: &str) {
        self.state.lock().params.insert(Param::AppId, app_id.to_string());
    }

    pub fn set_app_version(&self, version: &str) {
        self.state.lock().params.insert(Param::AppVersion, version.to_string());
    }

    pub fn set_app_screen(&self, screen: Option<&str>) {
        let mut state = self.state.lock();
        match screen {
            Some(screen) => state.params.insert(Param::ScreenName, screen.to_string()),
            None => state.params.remove(&Param::ScreenName),
        };
    }

    pub fn app_screen(&self) -> Option<String> {
        self.param(Param::ScreenName)
    }

    /// Attached to the next queued hit only
    pub fn set_referrer_url(&self, url: &str) {
        self.state.lock().params.insert(Param::ReferrerUrl, url.to_string());
    }

    /// Attached to the next queued hit only, expanded into campaign fields
    pub fn set_campaign_url(&self, url: &str) {
        self.state.lock().params.insert(Param::CampaignUrl, url.to_string());
    }

    pub fn set_anonymize(&self, anonymize: bool) {
        self.state.lock().anonymize = anonymize;
    }

    pub fn anonymize(&self) -> bool {
        self.state.lock().anonymize
    }

    pub fn set_use_https(&self, use_https: bool) {
        self.state.lock().use_https = use_https;
    }

    pub fn use_https(&self) -> bool {
        self.state.lock().use_https
    }

    /// Percentage of installations reported, in `[0, 100]`
    pub fn set_sample_rate(&self, rate: f64) -> Result<(), ParamError> {
        if !(0.0..=100.0).contains(&rate) {
            return Err(ParamError::InvalidValue {
                name: Param::SampleRate.name(),
                value: rate.to_string(),
            });
        }
        self.state.lock().sample_rate = rate;
        Ok(())
    }

    pub fn sample_rate(&self) -> f64 {
        self.state.lock().sample_rate
    }

    pub fn set_session_timeout(&self, timeout: Duration) {
        self.state.lock().session.set_timeout(timeout);
    }

    pub fn session_timeout(&self) -> Duration {
        self.state.lock().session.timeout()
    }

    /// Marks the next hit as the start of a new session
    pub fn start_session(&self) {
        self.state.lock().session.start_new();
    }

    /// Sets or clears a custom dimension carried by subsequent hits
    pub fn set_custom_dimension(&self, index: u32, value: Option<&str>) -> bool {
        if let Err(e) = check_custom_index(index) {
            debug!("Ignoring custom dimension: {}", e);
            return false;
        }
        let mut state = self.state.lock();
        match value {
            Some(value) => state.custom_dimensions.insert(index, value.to_string()),
            None => state.custom_dimensions.remove(&index),
        };
        true
    }

    /// Sets or clears a custom metric carried by subsequent hits
    pub fn set_custom_metric(&self, index: u32, value: Option<i64>) -> bool {
        if let Err(e) = check_custom_index(index) {
            debug!("Ignoring custom metric: {}", e);
            return false;
        }
        let mut state = self.state.lock();
        match value {
            Some(value) => state.custom_metrics.insert(index, value),
            None => state.custom_metrics.remove(&index),
        };
        true
    }

    // Sending

    /// Screen view for `screen`, or for the current app screen when `None`
    /// or empty. The given screen becomes the new app screen once the view
    /// is accepted.
    pub fn send_view(&self, screen: Option<&str>) -> bool {
        let params = match screen.filter(|s| !s.is_empty()) {
            Some(screen) => vec![(Param::ScreenName, screen.to_string())],
            None => Vec::new(),
        };
        self.queue(vec![(HitType::AppView, params)])
    }

    pub fn send_event(
        &self,
        category: &str,
        action: &str,
        label: Option<&str>,
        value: Option<i64>,
    ) -> bool {
        let mut params = vec![
            (Param::EventCategory, category.to_string()),
            (Param::EventAction, action.to_string()),
        ];
        if let Some(label) = label {
            params.push((Param::EventLabel, label.to_string()));
        }
        if let Some(value) = value {
            params.push((Param::EventValue, value.to_string()));
        }
        self.queue(vec![(HitType::Event, params)])
    }

    /// Transaction hit followed by one item hit per line item
    pub fn send_transaction(&self, transaction: &Transaction) -> bool {
        let mut hits = vec![(HitType::Transaction, transaction.params())];
        hits.extend(
            transaction
                .item_params()
                .into_iter()
                .map(|params| (HitType::Item, params)),
        );
        self.queue(hits)
    }

    /// `description` is already formatted by the caller
    pub fn send_exception(&self, fatal: bool, description: &str) -> bool {
        let params = vec![
            (Param::ExceptionDescription, description.to_string()),
            (Param::ExceptionFatal, if fatal { "1" } else { "0" }.to_string()),
        ];
        self.queue(vec![(HitType::Exception, params)])
    }

    pub fn send_timing(
        &self,
        category: &str,
        interval: Duration,
        name: Option<&str>,
        label: Option<&str>,
    ) -> bool {
        let mut params = vec![
            (Param::TimingCategory, category.to_string()),
            (Param::TimingValue, interval.as_millis().to_string()),
        ];
        if let Some(name) = name {
            params.push((Param::TimingVar, name.to_string()));
        }
        if let Some(label) = label {
            params.push((Param::TimingLabel, label.to_string()));
        }
        self.queue(vec![(HitType::Timing, params)])
    }

    pub fn send_social(&self, network: &str, action: &str, target: Option<&str>) -> bool {
        let mut params = vec![
            (Param::SocialNetwork, network.to_string()),
            (Param::SocialAction, action.to_string()),
        ];
        if let Some(target) = target {
            params.push((Param::SocialTarget, target.to_string()));
        }
        self.queue(vec![(HitType::Social, params)])
    }

    /// Queues a hit of any type with fields set just for this hit
    pub fn send<I, V>(&self, hit_type: HitType, params: I) -> bool
    where
        I: IntoIterator<Item = (Param, V)>,
        V: AsRef<str>,
    {
        let mut normalized = Vec::new();
        for (param, value) in params {
            match param.normalize(value.as_ref()) {
                Ok(value) => normalized.push((param, value)),
                Err(e) => {
                    debug!("Rejecting {} hit: {}", hit_type, e);
                    return false;
                }
            }
        }
        self.queue(vec![(hit_type, normalized)])
    }

    /// String-keyed form of [`Tracker::send`]
    pub fn send_named(&self, track_type: &str, params: &[(&str, &str)]) -> bool {
        let hit_type = match track_type.parse::<HitType>() {
            Ok(hit_type) => hit_type,
            Err(e) => {
                debug!("Rejecting hit: {}", e);
                return false;
            }
        };
        let mut typed = Vec::with_capacity(params.len());
        for (name, value) in params {
            match name.parse::<Param>() {
                Ok(param) => typed.push((param, *value)),
                Err(e) => {
                    debug!("Rejecting {} hit: {}", hit_type, e);
                    return false;
                }
            }
        }
        self.send(hit_type, typed)
    }

    // Lifecycle

    /// Stops all further tracking and removes the tracker from its registry.
    /// Hits already queued stay queued and are still dispatched.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing tracker {}", self.tracking_id);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_if(&self.tracking_id, |_, t| std::ptr::eq(t.as_ref(), self));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn build_hit(
        &self,
        state: &TrackerState,
        hit_type: HitType,
        call: Vec<(Param, String)>,
        now: DateTime<Utc>,
        session_start: bool,
    ) -> Option<Hit> {
        let hit = Hit {
            tracking_id: self.tracking_id.clone(),
            client_id: self.runtime.client_id.clone(),
            hit_type,
            timestamp: now,
            session_start,
            use_https: state.use_https,
            parameters: state.merged_params(call),
            custom_dimensions: state.custom_dimensions.clone(),
            custom_metrics: state.custom_metrics.clone(),
        };

        if let Some(missing) = hit.missing_required() {
            debug!("Not sending {} hit: {} is required", hit_type, missing);
            return None;
        }
        Some(hit)
    }

    /// Validates, samples, stamps and hands hits to the worker as one unit.
    ///
    /// `true` means the hits were accepted by the dispatch worker's channel
    /// (or sampled out). The durable write happens afterwards on the worker;
    /// if it fails the hit is dropped and a `DatabaseError` report is sent on
    /// the error channel instead.
    ///
    /// A screen name given with an app view becomes the tracker's app screen,
    /// but only once the call is accepted, under the same lock that read it.
    fn queue(&self, hits: Vec<(HitType, Vec<(Param, String)>)>) -> bool {
        if self.is_closed() {
            debug!("Tracker {} is closed, ignoring hit", self.tracking_id);
            return false;
        }
        if self.runtime.is_opted_out() {
            debug!("Opted out, ignoring hit for {}", self.tracking_id);
            return false;
        }

        let screen = hits
            .iter()
            .filter(|(hit_type, _)| *hit_type == HitType::AppView)
            .find_map(|(_, params)| {
                params
                    .iter()
                    .find(|(param, value)| *param == Param::ScreenName && !value.is_empty())
                    .map(|(_, value)| value.clone())
            });

        let mut state = self.state.lock();
        let now = self.runtime.clock.now();
        let mut session_start = state.session.begins_session(now);

        let mut built = Vec::with_capacity(hits.len());
        for (hit_type, params) in hits {
            match self.build_hit(&state, hit_type, params, now, session_start) {
                Some(hit) => built.push(hit),
                None => return false,
            }
            session_start = false;
        }

        if !sampler::should_admit(&self.runtime.client_id, state.sample_rate) {
            debug!(
                "Client sampled out at {}% for {}",
                state.sample_rate, self.tracking_id
            );
            if let Some(screen) = screen {
                state.params.insert(Param::ScreenName, screen);
            }
            return true;
        }

        let permits = match self.runtime.commands.try_reserve_many(built.len()) {
            Ok(permits) => permits,
            Err(e) => {
                warn!("Hit queue unavailable, dropping hit for {}: {}", self.tracking_id, e);
                return false;
            }
        };
        for (permit, hit) in permits.zip(built) {
            permit.send(Command::Enqueue(hit));
        }

        state.session.record_activity(now);
        state.params.retain(|param, _| !param.is_single_use());
        if let Some(screen) = screen {
            state.params.insert(Param::ScreenName, screen);
        }
        true
    }
}
