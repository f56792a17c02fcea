//! Scoring router choosing between alternative execution strategies
//!
//! Each request is scored for the low-latency `Streamlined` strategy and the
//! heavier `Orchestrated` one. The winner runs through the [`Dispatcher`];
//! if it fails, the other strategy runs exactly once and the result is
//! tagged as a fallback. Results are cached under the request's key and a
//! cache hit is reported as the `Cached` pseudo-strategy.

use crate::{
    cache::{CacheLayer, namespaces},
    dispatcher::{Dispatcher, OperationDescriptor},
    errors::{BoxError, DispatchError},
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Single pass, low latency
    Streamlined,
    /// Multi-step pipeline, slower and more thorough
    Orchestrated,
    /// Served from the cache without executing anything
    Cached,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Streamlined => "streamlined",
            Strategy::Orchestrated => "orchestrated",
            Strategy::Cached => "cached",
        }
    }

    /// The strategy tried when this one fails
    pub fn alternate(&self) -> Strategy {
        match self {
            Strategy::Streamlined => Strategy::Orchestrated,
            Strategy::Orchestrated | Strategy::Cached => Strategy::Streamlined,
        }
    }

    /// Dispatcher operation (and circuit) name for this strategy
    pub fn operation_name(&self) -> String {
        format!("strategy.{}", self.as_str())
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTarget {
    Basic,
    #[default]
    Standard,
    Premium,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemHealth {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

/// Source of the system health signal used during scoring
pub trait HealthReader: Send + Sync {
    fn health(&self) -> SystemHealth;

    /// Hour of day (0..24) for the time-of-day heuristic; UTC by default
    fn hour_of_day(&self) -> u32 {
        utc_hour()
    }
}

fn utc_hour() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| ((d.as_secs() / 3600) % 24) as u32)
        .unwrap_or(12)
}

/// Fixed health, optionally pinned to an hour
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticHealth {
    pub health: SystemHealth,
    pub hour: Option<u32>,
}

impl StaticHealth {
    pub fn new(health: SystemHealth) -> Self {
        Self { health, hour: None }
    }

    pub fn at_hour(mut self, hour: u32) -> Self {
        self.hour = Some(hour % 24);
        self
    }
}

impl HealthReader for StaticHealth {
    fn health(&self) -> SystemHealth {
        self.health
    }

    fn hour_of_day(&self) -> u32 {
        self.hour.unwrap_or_else(utc_hour)
    }
}

/// Runs one strategy for one request
pub trait StrategyExecutor<R>: Send + Sync {
    fn execute(
        &self,
        strategy: Strategy,
        request: RouteRequest,
    ) -> BoxFuture<'static, Result<R, BoxError>>;
}

impl<R, F> StrategyExecutor<R> for F
where
    F: Fn(Strategy, RouteRequest) -> BoxFuture<'static, Result<R, BoxError>> + Send + Sync,
{
    fn execute(
        &self,
        strategy: Strategy,
        request: RouteRequest,
    ) -> BoxFuture<'static, Result<R, BoxError>> {
        self(strategy, request)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub topic: String,
    pub item_count: usize,
    pub urgency: Urgency,
    pub quality: QualityTarget,
    pub needs_deep_research: bool,
    /// Skip scoring and run this strategy
    pub strategy_override: Option<Strategy>,
    /// Explicit cache key; derived from the request when absent
    pub cache_key: Option<String>,
}

impl RouteRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            item_count: 1,
            urgency: Urgency::default(),
            quality: QualityTarget::default(),
            needs_deep_research: false,
            strategy_override: None,
            cache_key: None,
        }
    }

    pub fn items(mut self, count: usize) -> Self {
        self.item_count = count;
        self
    }

    pub fn urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn quality(mut self, quality: QualityTarget) -> Self {
        self.quality = quality;
        self
    }

    pub fn deep_research(mut self, needed: bool) -> Self {
        self.needs_deep_research = needed;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy_override = Some(strategy);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Cache key for this request
    pub fn key(&self) -> String {
        match &self.cache_key {
            Some(key) => key.clone(),
            None => format!(
                "{}|{}|{:?}|{}",
                self.topic.trim().to_lowercase(),
                self.item_count,
                self.quality,
                self.needs_deep_research
            ),
        }
    }
}

/// Weighted contributions added to a strategy's score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterWeights {
    pub urgency: u32,
    pub quality: u32,
    pub deep_research: u32,
    pub single_item: u32,
    pub multi_item: u32,
    pub complexity_per_keyword: u32,
    pub complexity_cap: u32,
    pub degraded_health: u32,
    pub critical_health: u32,
    pub time_of_day: u32,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            urgency: 30,
            quality: 25,
            deep_research: 40,
            single_item: 15,
            multi_item: 20,
            complexity_per_keyword: 10,
            complexity_cap: 30,
            degraded_health: 20,
            critical_health: 40,
            time_of_day: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub weights: RouterWeights,
    /// The winner's score must be strictly above this
    pub min_score: u32,
    /// The winner must beat the runner-up by more than this
    pub decision_margin: u32,
    pub complexity_keywords: Vec<String>,
    /// Peak hours `[start, end)` favour the low-latency strategy
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,
    pub cache_namespace: String,
    pub strategy_timeout_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            weights: RouterWeights::default(),
            min_score: 10,
            decision_margin: 5,
            complexity_keywords: [
                "analysis",
                "architecture",
                "comparison",
                "comprehensive",
                "distributed",
                "in-depth",
                "optimization",
                "research",
                "tradeoff",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            peak_start_hour: 9,
            peak_end_hour: 18,
            cache_namespace: namespaces::GENERATED_ARTIFACT.to_string(),
            strategy_timeout_ms: 120_000,
        }
    }
}

impl RouterSettings {
    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    fn is_peak(&self, hour: u32) -> bool {
        if self.peak_start_hour <= self.peak_end_hour {
            (self.peak_start_hour..self.peak_end_hour).contains(&hour)
        } else {
            hour >= self.peak_start_hour || hour < self.peak_end_hour
        }
    }
}

/// Per-strategy scores and the factors that produced them
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreCard {
    pub streamlined: u32,
    pub orchestrated: u32,
    pub factors: Vec<String>,
}

impl ScoreCard {
    fn add(&mut self, strategy: Strategy, points: u32, factor: &str) {
        if points == 0 {
            return;
        }
        match strategy {
            Strategy::Streamlined => self.streamlined += points,
            Strategy::Orchestrated => self.orchestrated += points,
            Strategy::Cached => return,
        }
        self.factors.push(format!("{factor} +{points} {strategy}"));
    }

    pub fn score(&self, strategy: Strategy) -> u32 {
        match strategy {
            Strategy::Streamlined => self.streamlined,
            Strategy::Orchestrated => self.orchestrated,
            Strategy::Cached => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteDecision {
    pub strategy: Strategy,
    pub reason: String,
    pub estimated_latency_ms: u64,
    pub estimated_success_rate: f64,
    pub cache_key: Option<String>,
    pub scores: ScoreCard,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedResult<R> {
    pub result: R,
    pub routing: RouteDecision,
    /// Strategy that produced `result`
    pub executed: Strategy,
    pub is_fallback: bool,
}

/// Exponentially weighted latency and success rate of one strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StrategyStats {
    pub latency_ms: f64,
    pub success_rate: f64,
    pub executions: u64,
}

const STATS_ALPHA: f64 = 0.2;

impl StrategyStats {
    fn initial(strategy: Strategy) -> Self {
        let (latency_ms, success_rate) = match strategy {
            Strategy::Streamlined => (8_000.0, 0.92),
            Strategy::Orchestrated => (25_000.0, 0.97),
            Strategy::Cached => (0.0, 1.0),
        };
        Self {
            latency_ms,
            success_rate,
            executions: 0,
        }
    }

    fn observe(&mut self, latency: Duration, succeeded: bool) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let success = if succeeded { 1.0 } else { 0.0 };
        self.latency_ms += STATS_ALPHA * (latency_ms - self.latency_ms);
        self.success_rate += STATS_ALPHA * (success - self.success_rate);
        self.executions += 1;
    }
}

pub struct StrategyRouter<R> {
    dispatcher: Dispatcher,
    cache: Arc<CacheLayer<R>>,
    executor: Arc<dyn StrategyExecutor<R>>,
    health: Arc<dyn HealthReader>,
    settings: RouterSettings,
    stats: Mutex<HashMap<Strategy, StrategyStats>>,
}

impl<R> std::fmt::Debug for StrategyRouter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyRouter")
            .field("settings", &self.settings)
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl<R> StrategyRouter<R>
where
    R: Clone + Send + Sync + 'static,
{
    pub fn new(
        dispatcher: Dispatcher,
        cache: Arc<CacheLayer<R>>,
        executor: Arc<dyn StrategyExecutor<R>>,
        health: Arc<dyn HealthReader>,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            executor,
            health,
            settings: RouterSettings::default(),
            stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_settings(mut self, settings: RouterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    pub fn stats(&self, strategy: Strategy) -> StrategyStats {
        self.stats
            .lock()
            .get(&strategy)
            .copied()
            .unwrap_or_else(|| StrategyStats::initial(strategy))
    }

    /// Additive score for both executable strategies
    pub fn score(&self, request: &RouteRequest) -> ScoreCard {
        let w = &self.settings.weights;
        let mut card = ScoreCard::default();

        match request.urgency {
            Urgency::High => card.add(Strategy::Streamlined, w.urgency, "urgency:high"),
            Urgency::Low => card.add(Strategy::Orchestrated, w.urgency, "urgency:low"),
            Urgency::Normal => {}
        }

        match request.quality {
            QualityTarget::Basic => card.add(Strategy::Streamlined, w.quality, "quality:basic"),
            QualityTarget::Premium => {
                card.add(Strategy::Orchestrated, w.quality, "quality:premium")
            }
            QualityTarget::Standard => {}
        }

        if request.needs_deep_research {
            card.add(Strategy::Orchestrated, w.deep_research, "deep_research");
        }

        if request.item_count <= 1 {
            card.add(Strategy::Streamlined, w.single_item, "single_item");
        } else {
            card.add(Strategy::Orchestrated, w.multi_item, "multi_item");
        }

        let topic = request.topic.to_lowercase();
        let matches = self
            .settings
            .complexity_keywords
            .iter()
            .filter(|keyword| topic.contains(keyword.to_lowercase().as_str()))
            .count();
        let complexity = (matches as u32)
            .saturating_mul(w.complexity_per_keyword)
            .min(w.complexity_cap);
        card.add(Strategy::Orchestrated, complexity, "complexity");

        match self.health.health() {
            SystemHealth::Degraded => {
                card.add(Strategy::Streamlined, w.degraded_health, "health:degraded")
            }
            SystemHealth::Critical => {
                card.add(Strategy::Streamlined, w.critical_health, "health:critical")
            }
            SystemHealth::Healthy => {}
        }

        if self.settings.is_peak(self.health.hour_of_day()) {
            card.add(Strategy::Streamlined, w.time_of_day, "peak_hours");
        } else {
            card.add(Strategy::Orchestrated, w.time_of_day, "off_peak");
        }

        card
    }

    /// Routing decision for `request` without executing it or reading the cache
    pub fn route(&self, request: &RouteRequest) -> RouteDecision {
        let cache_key = Some(request.key());

        if let Some(strategy) = request.strategy_override.filter(|s| *s != Strategy::Cached) {
            return self.decision(
                strategy,
                "caller override".to_string(),
                cache_key,
                ScoreCard::default(),
            );
        }

        let scores = self.score(request);
        let (top, runner_up) = if scores.streamlined >= scores.orchestrated {
            (Strategy::Streamlined, Strategy::Orchestrated)
        } else {
            (Strategy::Orchestrated, Strategy::Streamlined)
        };
        let top_score = scores.score(top);
        let runner_score = scores.score(runner_up);

        let (strategy, reason) = if top_score > self.settings.min_score
            && top_score - runner_score > self.settings.decision_margin
        {
            (top, format!("{top} scored {top_score} vs {runner_score}"))
        } else {
            let strategy = if request.item_count <= 1 {
                Strategy::Streamlined
            } else {
                Strategy::Orchestrated
            };
            (
                strategy,
                format!("tie-break to {strategy} ({top_score} vs {runner_score} within margin)"),
            )
        };

        self.decision(strategy, reason, cache_key, scores)
    }

    fn decision(
        &self,
        strategy: Strategy,
        reason: String,
        cache_key: Option<String>,
        scores: ScoreCard,
    ) -> RouteDecision {
        let stats = self.stats(strategy);
        RouteDecision {
            strategy,
            reason,
            estimated_latency_ms: stats.latency_ms.round() as u64,
            estimated_success_rate: stats.success_rate,
            cache_key,
            scores,
        }
    }

    /// Route, then execute with a single fallback to the alternate strategy
    pub async fn route_and_execute(
        &self,
        request: RouteRequest,
    ) -> Result<RoutedResult<R>, DispatchError> {
        let key = request.key();
        let namespace = self.settings.cache_namespace.as_str();

        if let Some(result) = self.cache.get(namespace, &key) {
            tracing::debug!(namespace, key = %key, "serving routed request from cache");
            let routing = self.decision(
                Strategy::Cached,
                "cache hit".to_string(),
                Some(key),
                ScoreCard::default(),
            );
            return Ok(RoutedResult {
                result,
                routing,
                executed: Strategy::Cached,
                is_fallback: false,
            });
        }

        let routing = self.route(&request);
        tracing::info!(strategy = %routing.strategy, reason = %routing.reason, "routing request");

        let primary_error = match self.run(routing.strategy, &request).await {
            Ok(result) => {
                self.cache.set(namespace, key, result.clone());
                return Ok(RoutedResult {
                    executed: routing.strategy,
                    result,
                    routing,
                    is_fallback: false,
                });
            }
            Err(error) => error,
        };

        let alternate = routing.strategy.alternate();
        tracing::warn!(
            strategy = %routing.strategy,
            fallback = %alternate,
            error = %primary_error,
            "strategy failed, trying alternate"
        );

        match self.run(alternate, &request).await {
            Ok(result) => {
                self.cache.set(namespace, key, result.clone());
                Ok(RoutedResult {
                    result,
                    routing,
                    executed: alternate,
                    is_fallback: true,
                })
            }
            Err(fallback_error) => {
                tracing::error!(
                    strategy = %alternate,
                    error = %fallback_error,
                    "alternate strategy failed"
                );
                Err(DispatchError::AllStrategiesFailed {
                    primary: Box::new(primary_error),
                    fallback: Box::new(fallback_error),
                })
            }
        }
    }

    async fn run(&self, strategy: Strategy, request: &RouteRequest) -> Result<R, DispatchError> {
        let executor = Arc::clone(&self.executor);
        let request = request.clone();
        let op = OperationDescriptor::new(strategy.operation_name(), move || {
            executor.execute(strategy, request.clone())
        })
        .timeout(self.settings.strategy_timeout())
        .max_retries(0);

        let result = self.dispatcher.execute(op).await;
        // Circuit rejections say nothing about the strategy's own health
        if !result.error().is_some_and(DispatchError::is_circuit_open) {
            self.stats
                .lock()
                .entry(strategy)
                .or_insert_with(|| StrategyStats::initial(strategy))
                .observe(result.duration, result.is_ok());
        }
        result.into_result()
    }
}
