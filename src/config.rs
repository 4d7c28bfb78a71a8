//! Configuração do taskforge carregada a partir de `taskforge.toml`.
//!
//! A struct [`OrchestratorConfig`] contém todos os parâmetros configuráveis
//! (orçamentos, limiares e parâmetros dos wrappers de confiabilidade).
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `TASKFORGE_CONCURRENCY_CAP` tem precedência sobre o arquivo.
//!
//! A configuração é passada explicitamente na construção das máquinas; não
//! existe estado global.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "taskforge.toml";

/// Configuração de nível superior carregada de `taskforge.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub delegation: DelegationConfig,
    #[serde(default)]
    pub work_loop: WorkLoopConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Parâmetros de delegação de subagentes.
#[derive(Debug, Clone, Deserialize)]
pub struct DelegationConfig {
    /// Máximo de subagentes executando em paralelo.
    #[serde(default = "default_concurrency_cap")]
    pub concurrency_cap: usize,
}

/// Orçamentos do loop de trabalho (plan → act → evaluate).
#[derive(Debug, Clone, Deserialize)]
pub struct WorkLoopConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_subagent_calls")]
    pub max_subagent_calls: u32,
    #[serde(default = "default_max_wall_clock_ms")]
    pub max_wall_clock_ms: u64,
    /// Iterações consecutivas sem nova evidência antes de parar.
    #[serde(default = "default_stagnation_threshold")]
    pub stagnation_threshold: u32,
    /// Risco máximo tolerado para um achado (severidade × confiança).
    #[serde(default = "default_max_risk")]
    pub max_risk: f64,
}

/// Parâmetros do loop de revisão.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

/// Parâmetros dos wrappers de confiabilidade, aplicados a cada recurso.
#[derive(Debug, Clone, Deserialize)]
pub struct ReliabilityConfig {
    /// Timeout por chamada externa.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
}

/// Configuração do comportamento de retentativa.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Número máximo de tentativas (incluindo a primeira).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fração de jitter aplicada ao atraso (0.0 desliga).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default = "default_bucket_capacity")]
    pub capacity: u32,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkheadConfig {
    #[serde(default = "default_bulkhead_capacity")]
    pub capacity: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

/// Saída de logs (`tracing`).
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

// Valor padrão do limite de concorrência: 4 subagentes.
fn default_concurrency_cap() -> usize {
    4
}

// Valor padrão para iterações máximas: 5.
fn default_max_iterations() -> u32 {
    5
}

fn default_max_subagent_calls() -> u32 {
    32
}

// Dez minutos de relógio por execução.
fn default_max_wall_clock_ms() -> u64 {
    600_000
}

fn default_stagnation_threshold() -> u32 {
    2
}

fn default_max_risk() -> f64 {
    0.95
}

fn default_confidence_threshold() -> f64 {
    0.50
}

fn default_call_timeout_ms() -> u64 {
    120_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_bucket_capacity() -> u32 {
    10
}

fn default_refill_per_sec() -> f64 {
    2.0
}

fn default_bulkhead_capacity() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            concurrency_cap: default_concurrency_cap(),
        }
    }
}

impl Default for WorkLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_subagent_calls: default_max_subagent_calls(),
            max_wall_clock_ms: default_max_wall_clock_ms(),
            stagnation_threshold: default_stagnation_threshold(),
            max_risk: default_max_risk(),
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            bulkhead: BulkheadConfig::default(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_bucket_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            capacity: default_bulkhead_capacity(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl WorkLoopConfig {
    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms)
    }
}

impl ReliabilityConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

impl RetryConfig {
    /// Atraso (sem jitter) antes da retentativa `attempt`, contando a partir de 0.
    /// delay = base_delay_ms * 2^attempt, limitado por `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(31))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

impl BulkheadConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl OrchestratorConfig {
    /// Carrega a configuração de `taskforge.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<OrchestratorConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo.
        if let Ok(raw) = std::env::var("TASKFORGE_CONCURRENCY_CAP") {
            if let Ok(cap) = raw.trim().parse::<usize>() {
                config.delegation.concurrency_cap = cap;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita valores que tornariam os loops ou os wrappers inoperantes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
            Ok(())
        }
        fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError {
                    field,
                    reason: format!("{value} is outside [0.0, 1.0]"),
                });
            }
            Ok(())
        }

        non_zero("delegation.concurrency_cap", self.delegation.concurrency_cap as u64)?;
        non_zero("work_loop.max_iterations", self.work_loop.max_iterations.into())?;
        non_zero("work_loop.stagnation_threshold", self.work_loop.stagnation_threshold.into())?;
        non_zero("review.max_iterations", self.review.max_iterations.into())?;
        unit_interval("review.confidence_threshold", self.review.confidence_threshold)?;
        unit_interval("reliability.retry.jitter_factor", self.reliability.retry.jitter_factor)?;
        non_zero("reliability.retry.max_attempts", self.reliability.retry.max_attempts.into())?;
        non_zero(
            "reliability.circuit_breaker.failure_threshold",
            self.reliability.circuit_breaker.failure_threshold.into(),
        )?;
        non_zero("reliability.rate_limiter.capacity", self.reliability.rate_limiter.capacity.into())?;
        non_zero("reliability.bulkhead.capacity", self.reliability.bulkhead.capacity as u64)?;
        if self.reliability.rate_limiter.refill_per_sec < 0.0 {
            return Err(ConfigError {
                field: "reliability.rate_limiter.refill_per_sec",
                reason: "must not be negative".into(),
            });
        }
        Ok(())
    }
}
