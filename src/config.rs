//! Configuração do wetloop carregada a partir de `wetloop.toml`.
//!
//! A struct [`WetloopConfig`] contém todos os parâmetros configuráveis,
//! agrupados por seção. Valores não presentes no arquivo usam defaults
//! sensíveis. A variável de ambiente `WORKCELL_URL` tem precedência sobre o
//! arquivo; a flag `--workcell` da CLI tem precedência sobre as duas.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::composition::Bounds;
use crate::lifecycle::PollPolicy;
use crate::optimizer::TimeoutPolicy;
use crate::transfer::DEFAULT_MAX_TRANSFERS;
use crate::workcell::{DEFAULT_WORKCELL_URL, RetryConfig};

pub const CONFIG_FILE: &str = "wetloop.toml";
pub const WORKCELL_URL_ENV: &str = "WORKCELL_URL";

/// Configuração de nível superior carregada de `wetloop.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct WetloopConfig {
    /// URL base do workcell.
    #[serde(default = "default_workcell_url")]
    pub workcell_url: String,

    /// Limites físicos do poço e das suplementações.
    #[serde(default)]
    pub bounds: Bounds,

    #[serde(default)]
    pub planner: PlannerConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    /// Máximo de transferências aceitas pelo equipamento num único job.
    #[serde(default = "default_max_transfers")]
    pub max_transfers: usize,
}

/// Cadência de polling e timeouts das chamadas ao workcell.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Espera máxima por job, em minutos.
    #[serde(default = "default_max_wait_minutes")]
    pub max_wait_minutes: u64,

    /// Falhas de transporte seguidas toleradas antes de desistir.
    #[serde(default = "default_max_consecutive_poll_failures")]
    pub max_consecutive_poll_failures: u32,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Retentativas para leituras idempotentes (nunca para submissões).
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Passo da perturbação em µL.
    #[serde(default = "default_delta")]
    pub delta: i32,

    /// Primeira coluna experimental; a coluna 1 guarda os poços de semente.
    #[serde(default = "default_first_column")]
    pub first_column: u8,

    #[serde(default)]
    pub on_timeout: TimeoutPolicy,

    /// Diretório onde o `history.json` de cada execução é gravado.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
}

fn default_workcell_url() -> String {
    DEFAULT_WORKCELL_URL.to_string()
}

fn default_max_transfers() -> usize {
    DEFAULT_MAX_TRANSFERS
}

// 30 segundos entre consultas de status.
fn default_poll_interval_secs() -> u64 {
    30
}

// 3 horas por job.
fn default_max_wait_minutes() -> u64 {
    180
}

fn default_max_consecutive_poll_failures() -> u32 {
    5
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_read_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_learning_rate() -> f64 {
    5.0
}

fn default_delta() -> i32 {
    10
}

fn default_first_column() -> u8 {
    2
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl Default for WetloopConfig {
    fn default() -> Self {
        Self {
            workcell_url: default_workcell_url(),
            bounds: Bounds::default(),
            planner: PlannerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_transfers: default_max_transfers(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_wait_minutes: default_max_wait_minutes(),
            max_consecutive_poll_failures: default_max_consecutive_poll_failures(),
            call_timeout_secs: default_call_timeout_secs(),
            read_retries: default_read_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            delta: default_delta(),
            first_column: default_first_column(),
            on_timeout: TimeoutPolicy::default(),
            run_dir: default_run_dir(),
        }
    }
}

impl LifecycleConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_wait: Duration::from_secs(self.max_wait_minutes * 60),
            max_consecutive_failures: self.max_consecutive_poll_failures,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn read_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.read_retries,
            base_delay_ms: self.retry_base_delay_ms,
        }
    }
}

impl WetloopConfig {
    /// Carrega a configuração de `wetloop.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Path::new(CONFIG_FILE))?;

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(url) = std::env::var(WORKCELL_URL_ENV)
            && !url.is_empty()
        {
            config.workcell_url = url;
        }

        Ok(config)
    }

    /// Lê um arquivo específico, sem aplicar variáveis de ambiente.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<WetloopConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.bounds.validate()?;
        anyhow::ensure!(
            config.optimizer.learning_rate.is_finite() && config.optimizer.learning_rate >= 0.0,
            "optimizer.learning_rate must be a finite, non-negative number (got {})",
            config.optimizer.learning_rate
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = WetloopConfig::load_from(Path::new("does-not-exist.toml")).unwrap();
        assert_eq!(config.workcell_url, DEFAULT_WORKCELL_URL);
        assert_eq!(config.bounds, Bounds::default());
        assert_eq!(config.planner.max_transfers, 30);
        assert_eq!(config.lifecycle.poll_interval_secs, 30);
        assert_eq!(config.lifecycle.max_wait_minutes, 180);
        assert_eq!(config.optimizer.learning_rate, 5.0);
        assert_eq!(config.optimizer.first_column, 2);
        assert_eq!(config.optimizer.on_timeout, TimeoutPolicy::Abort);
        assert_eq!(config.optimizer.run_dir, PathBuf::from("runs"));
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            workcell_url = "http://10.0.0.5:8080"

            [bounds]
            max_supplement = 60

            [lifecycle]
            poll_interval_secs = 10

            [optimizer]
            on_timeout = "skip_round"
        "#;
        let config: WetloopConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workcell_url, "http://10.0.0.5:8080");
        assert_eq!(config.bounds.max_supplement, 60);
        assert_eq!(config.bounds.well_capacity, 180);
        assert_eq!(config.lifecycle.poll_interval_secs, 10);
        assert_eq!(config.lifecycle.max_consecutive_poll_failures, 5);
        assert_eq!(config.optimizer.on_timeout, TimeoutPolicy::SkipRound);
        assert_eq!(config.optimizer.delta, 10);
    }

    #[test]
    fn lifecycle_conversions() {
        let lifecycle = LifecycleConfig::default();
        let policy = lifecycle.poll_policy();
        assert_eq!(policy.poll_interval, Duration::from_secs(30));
        assert_eq!(policy.max_wait, Duration::from_secs(3 * 60 * 60));
        assert_eq!(lifecycle.call_timeout(), Duration::from_secs(30));
        assert_eq!(lifecycle.read_retry().max_retries, 2);
        assert_eq!(lifecycle.read_retry().delay_for_attempt(2), 1000);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[planner]\nmax_transfers = 24\n").unwrap();

        let config = WetloopConfig::load_from(&path).unwrap();
        assert_eq!(config.planner.max_transfers, 24);
        assert_eq!(config.workcell_url, DEFAULT_WORKCELL_URL);
    }

    #[test]
    fn contradictory_bounds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[bounds]\nmin_base = 178\nmin_supplement = 5\n").unwrap();
        assert!(WetloopConfig::load_from(&path).is_err());
    }

    #[test]
    fn invalid_learning_rate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        for rate in ["-1.0", "inf", "nan"] {
            std::fs::write(&path, format!("[optimizer]\nlearning_rate = {rate}\n")).unwrap();
            assert!(
                WetloopConfig::load_from(&path).is_err(),
                "learning_rate {rate} was accepted"
            );
        }

        std::fs::write(&path, "[optimizer]\nlearning_rate = 0.0\n").unwrap();
        assert_eq!(WetloopConfig::load_from(&path).unwrap().optimizer.learning_rate, 0.0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "workcell_url = [").unwrap();
        assert!(WetloopConfig::load_from(&path).is_err());
    }
}
