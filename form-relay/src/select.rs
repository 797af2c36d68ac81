//! Candidate ranking for new circuits.
//!
//! Live nodes are split into three tiers from their score history:
//! proven (`Good`), too few samples to judge (`Unknown`) and everything
//! else (`Bad`). A request draws mostly from `Good`, always leaves room
//! for `Unknown` so fresh nodes collect data, and only reaches into `Bad`
//! when nothing else is left.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::debug;
use rand::{seq::SliceRandom, Rng};

use crate::{
    config::ScoreConfig,
    hub::{Hub, NodeConnection},
    score::{NodeScore, ScoreBoard},
    store::ANY_COUNTRY,
    warm::WarmPool,
};

#[async_trait]
pub trait NodeSelector: Send + Sync {
    /// Up to `count` connected, unquarantined nodes not in `skip`,
    /// preferring `country` when any such node exists.
    async fn top_nodes(&self, country: &str, count: usize, skip: &HashSet<String>) -> Vec<Arc<NodeConnection>>;

    fn record_result(&self, node_id: &str, success: bool, latency: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Good,
    Unknown,
    Bad,
}

/// Places a node in a tier. Lower-trust connection classes never count
/// as good and start out as bad until they have proven themselves.
pub fn classify(score: Option<&NodeScore>, lower_trust: bool, config: &ScoreConfig) -> Tier {
    match score {
        Some(s) if s.total() >= config.tier_min_samples => {
            if s.success_rate() >= config.good_rate {
                if lower_trust {
                    Tier::Unknown
                } else {
                    Tier::Good
                }
            } else {
                Tier::Bad
            }
        }
        _ if lower_trust => Tier::Bad,
        _ => Tier::Unknown,
    }
}

/// Draws `count` items from the shuffled tiers.
///
/// The exploration share is rounded randomly: with `count = 3` and a 15%
/// share, 45% of calls reserve one slot for an unknown node. Small
/// requests therefore still explore, without a fixed slot skewing every
/// call.
pub fn mix<T, R: Rng + ?Sized>(
    mut good: Vec<T>,
    mut unknown: Vec<T>,
    mut bad: Vec<T>,
    count: usize,
    config: &ScoreConfig,
    rng: &mut R,
) -> Vec<T> {
    good.shuffle(rng);
    unknown.shuffle(rng);
    bad.shuffle(rng);

    let expected = count as f64 * config.unknown_share.clamp(0.0, 1.0);
    let mut unknown_slots = expected.floor() as usize;
    if rng.gen_bool((expected - expected.floor()).clamp(0.0, 1.0)) {
        unknown_slots += 1;
    }
    let unknown_slots = unknown_slots.min(unknown.len()).min(count);
    let good_slots = ((count as f64 * config.good_share.clamp(0.0, 1.0)).ceil() as usize)
        .min(count - unknown_slots)
        .min(good.len());

    let mut out = Vec::with_capacity(count);
    let mut good = good.into_iter();
    let mut unknown = unknown.into_iter();
    let mut bad = bad.into_iter();
    out.extend(good.by_ref().take(good_slots));
    out.extend(unknown.by_ref().take(unknown_slots));

    for tier in [&mut good, &mut unknown, &mut bad] {
        let missing = count.saturating_sub(out.len());
        if missing == 0 {
            break;
        }
        out.extend(tier.take(missing));
    }

    out.shuffle(rng);
    out
}

/// Open and past the registration handshake. Refused or silent
/// connections never carry client traffic.
pub fn is_routable(conn: &NodeConnection) -> bool {
    !conn.is_closed() && conn.info().registered
}

/// Score-driven selection over the hub's live connections.
pub struct TieredSelector {
    hub: Arc<Hub>,
    scores: Arc<ScoreBoard>,
}

impl TieredSelector {
    pub fn new(hub: Arc<Hub>, scores: Arc<ScoreBoard>) -> Self {
        Self { hub, scores }
    }

    pub fn select(&self, country: &str, count: usize, skip: &HashSet<String>) -> Vec<Arc<NodeConnection>> {
        if count == 0 {
            return Vec::new();
        }
        let config = self.scores.config();

        let mut eligible: Vec<Arc<NodeConnection>> = self
            .hub
            .all_connections()
            .into_iter()
            .filter(|c| is_routable(c) && !skip.contains(c.node_id()))
            .collect();

        let country = country.trim().to_uppercase();
        if !country.is_empty() && country != ANY_COUNTRY {
            let matching: Vec<_> = eligible
                .iter()
                .filter(|c| c.country().eq_ignore_ascii_case(&country))
                .cloned()
                .collect();
            if matching.is_empty() {
                debug!("no nodes in {country}, selecting from all countries");
            } else {
                eligible = matching;
            }
        }

        let scores = self.scores.get_many(eligible.iter().map(|c| c.node_id()));
        let (mut good, mut unknown, mut bad) = (Vec::new(), Vec::new(), Vec::new());
        for conn in eligible {
            let score = scores.get(conn.node_id());
            if score.map(NodeScore::is_quarantined).unwrap_or(false) {
                continue;
            }
            let lower_trust = {
                let class = conn.proxy_type();
                config.lower_trust.iter().any(|t| t.eq_ignore_ascii_case(&class))
            };
            match classify(score, lower_trust, config) {
                Tier::Good => good.push(conn),
                Tier::Unknown => unknown.push(conn),
                Tier::Bad => bad.push(conn),
            }
        }

        mix(good, unknown, bad, count, config, &mut rand::thread_rng())
    }
}

#[async_trait]
impl NodeSelector for TieredSelector {
    async fn top_nodes(&self, country: &str, count: usize, skip: &HashSet<String>) -> Vec<Arc<NodeConnection>> {
        self.select(country, count, skip)
    }

    fn record_result(&self, node_id: &str, success: bool, latency: Duration) {
        self.scores.record_result(node_id, success, latency);
    }
}

/// Puts a validated fast-lane node first when one is available, then
/// fills from the tiered ranking.
pub struct FastLaneSelector {
    warm: Arc<WarmPool>,
    tiered: TieredSelector,
}

impl FastLaneSelector {
    pub fn new(warm: Arc<WarmPool>, tiered: TieredSelector) -> Self {
        Self { warm, tiered }
    }
}

#[async_trait]
impl NodeSelector for FastLaneSelector {
    async fn top_nodes(&self, country: &str, count: usize, skip: &HashSet<String>) -> Vec<Arc<NodeConnection>> {
        if count == 0 {
            return Vec::new();
        }
        let fast = match self.warm.get_fast_node(country).await {
            Some(conn) if !skip.contains(conn.node_id()) => Some(conn),
            _ => None,
        };
        let Some(fast) = fast else {
            return self.tiered.select(country, count, skip);
        };

        let mut skip = skip.clone();
        skip.insert(fast.node_id().to_string());
        let mut out = vec![fast];
        out.extend(self.tiered.select(country, count - 1, &skip));
        out
    }

    fn record_result(&self, node_id: &str, success: bool, latency: Duration) {
        self.tiered.record_result(node_id, success, latency);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::HubConfig,
        events::EventQueue,
        hub::NodeInfo,
    };
    use rand::{rngs::StdRng, SeedableRng};

    const MS: Duration = Duration::from_millis(1);

    struct Fixture {
        hub: Arc<Hub>,
        scores: Arc<ScoreBoard>,
        selector: TieredSelector,
        _events: EventQueue,
    }

    fn fixture() -> Fixture {
        let events = EventQueue::new(64);
        let hub = Arc::new(Hub::new(HubConfig::default(), events.publisher()));
        let scores = Arc::new(ScoreBoard::new(ScoreConfig::default()));
        let selector = TieredSelector::new(hub.clone(), scores.clone());
        Fixture {
            hub,
            scores,
            selector,
            _events: events,
        }
    }

    impl Fixture {
        fn node(&self, node_id: &str, country: &str, proxy_type: &str) {
            let (conn, queues) = NodeConnection::new(
                NodeInfo {
                    node_id: node_id.into(),
                    country: country.into(),
                    proxy_type: proxy_type.into(),
                    registered: true,
                    ..Default::default()
                },
                8,
            );
            // queues are dropped: these nodes are never written to
            drop(queues);
            self.hub.add(conn).unwrap();
        }

        fn record(&self, node_id: &str, success: usize, fail: usize) {
            for _ in 0..success {
                self.scores.record_result(node_id, true, 10 * MS);
            }
            for _ in 0..fail {
                self.scores.record_result(node_id, false, MS);
            }
        }

        fn ids(&self, country: &str, count: usize, skip: &[&str]) -> HashSet<String> {
            let skip = skip.iter().map(|s| s.to_string()).collect();
            self.selector
                .select(country, count, &skip)
                .iter()
                .map(|c| c.node_id().to_string())
                .collect()
        }
    }

    #[test]
    fn tiers_follow_samples_and_rate() {
        let config = ScoreConfig::default();
        let board = ScoreBoard::new(config.clone());
        board.record_result("fresh", true, MS);
        for _ in 0..3 {
            board.record_result("good", true, MS);
            board.record_result("bad", false, MS);
        }
        let fresh = board.get("fresh");
        let good = board.get("good");
        let bad = board.get("bad");

        assert_eq!(classify(None, false, &config), Tier::Unknown);
        assert_eq!(classify(fresh.as_ref(), false, &config), Tier::Unknown);
        assert_eq!(classify(good.as_ref(), false, &config), Tier::Good);
        assert_eq!(classify(bad.as_ref(), false, &config), Tier::Bad);

        assert_eq!(classify(None, true, &config), Tier::Bad);
        assert_eq!(classify(good.as_ref(), true, &config), Tier::Unknown);
    }

    #[test]
    fn mix_fills_good_then_unknown_then_bad() {
        let config = ScoreConfig::default();
        let mut rng = StdRng::seed_from_u64(7);
        let out = mix(vec!["g1"], vec!["u1"], vec!["b1", "b2"], 4, &config, &mut rng);
        assert_eq!(out.len(), 4);
        let set: HashSet<_> = out.into_iter().collect();
        assert!(set.contains("g1") && set.contains("u1"));

        let out = mix(Vec::<&str>::new(), vec![], vec!["b1"], 3, &config, &mut rng);
        assert_eq!(out, vec!["b1"]);
    }

    #[test]
    fn mix_reserves_unknown_slots_on_large_requests() {
        let config = ScoreConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let good: Vec<String> = (0..50).map(|i| format!("g{i}")).collect();
        let unknown: Vec<String> = (0..50).map(|i| format!("u{i}")).collect();
        let out = mix(good, unknown, vec![], 20, &config, &mut rng);
        assert_eq!(out.len(), 20);
        let explored = out.iter().filter(|id| id.starts_with('u')).count();
        assert!((3..=4).contains(&explored), "explored {explored}");
    }

    #[tokio::test(start_paused = true)]
    async fn quarantined_nodes_are_excluded_until_expiry() {
        let f = fixture();
        f.node("n1", "US", "");
        f.node("n2", "US", "");
        f.record("n1", 1, 4);
        assert!(f.scores.is_quarantined("n1"));

        for _ in 0..20 {
            assert!(!f.ids("US", 3, &[]).contains("n1"));
        }

        tokio::time::advance(Duration::from_secs(10 * 60 + 1)).await;
        assert!(f.ids("US", 3, &[]).contains("n1"));
    }

    #[tokio::test]
    async fn small_requests_still_explore() {
        let f = fixture();
        for i in 0..5 {
            let id = format!("good{i}");
            f.node(&id, "US", "");
            f.record(&id, 5, 0);
        }
        f.node("fresh", "US", "");

        let explored = (0..200).any(|_| f.ids("US", 3, &[]).contains("fresh"));
        assert!(explored);
    }

    #[tokio::test]
    async fn country_filter_falls_back_to_all_nodes() {
        let f = fixture();
        f.node("us1", "US", "");
        f.node("de1", "DE", "");

        assert_eq!(f.ids("de", 3, &[]), HashSet::from(["de1".to_string()]));
        assert_eq!(f.ids("FR", 3, &[]).len(), 2);
        assert_eq!(f.ids("", 3, &["us1"]), HashSet::from(["de1".to_string()]));
    }

    #[tokio::test]
    async fn lower_trust_nodes_are_last_resort() {
        let f = fixture();
        f.node("res", "US", "");
        f.node("vpn", "US", "VPN");
        for _ in 0..20 {
            let picked = f.selector.select("US", 1, &HashSet::new());
            assert_eq!(picked[0].node_id(), "res");
        }
        assert_eq!(f.ids("US", 2, &[]).len(), 2);
    }

    #[tokio::test]
    async fn unregistered_nodes_are_never_selected() {
        let f = fixture();
        f.node("ok", "US", "");
        let (refused, _queues) = NodeConnection::new(
            NodeInfo {
                node_id: "old-sdk".into(),
                country: "US".into(),
                sdk_version: "0.1.0".into(),
                ..Default::default()
            },
            8,
        );
        f.hub.add(refused.clone()).unwrap();

        for _ in 0..10 {
            assert_eq!(f.ids("US", 3, &[]), HashSet::from(["ok".to_string()]));
        }
        assert!(!is_routable(&refused));

        refused.update_info(|info| info.registered = true);
        assert_eq!(f.ids("US", 3, &[]).len(), 2);
    }
}
