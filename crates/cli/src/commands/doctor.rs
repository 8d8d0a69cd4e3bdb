use ragway_core::config::{AppConfig, LlmProvider, LoadOptions};
use ragway_db::{connect, migrations};
use serde::Serialize;

use crate::commands::{block_on, escape_json, CommandResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };
    CommandResult::report(exit_code, output)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_provider_credentials(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.push(DoctorCheck::skipped("provider_credentials"));
            checks.push(DoctorCheck::skipped("database_connectivity"));
            checks.push(DoctorCheck::skipped("schema_version"));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_provider_credentials(config: &AppConfig) -> DoctorCheck {
    match (&config.llm.provider, &config.llm.api_key) {
        (LlmProvider::Ollama, _) => DoctorCheck::pass(
            "provider_credentials",
            format!("ollama model `{}` needs no api key", config.llm.model),
        ),
        (LlmProvider::OpenAi, Some(_)) => DoctorCheck::pass(
            "provider_credentials",
            format!("openai api key present for model `{}`", config.llm.model),
        ),
        (LlmProvider::OpenAi, None) => {
            DoctorCheck::fail("provider_credentials", "openai provider requires llm.api_key")
        }
    }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let outcome = block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let version = migrations::applied_version(&pool).await;
        pool.close().await;
        Ok::<_, String>(version)
    });

    match outcome.and_then(|connected| connected) {
        Err(error) => vec![
            DoctorCheck::fail("database_connectivity", error),
            DoctorCheck::fail("schema_version", "database unreachable"),
        ],
        Ok(version) => {
            let connectivity = DoctorCheck::pass(
                "database_connectivity",
                format!("connected using `{}`", config.database.url),
            );
            let schema = match version {
                Ok(Some(version)) => {
                    DoctorCheck::pass("schema_version", format!("schema version {version} applied"))
                }
                Ok(None) => DoctorCheck::fail(
                    "schema_version",
                    "migrations have not been applied; run `ragway migrate`",
                ),
                Err(error) => {
                    DoctorCheck::fail("schema_version", format!("schema query failed: {error}"))
                }
            };
            vec![connectivity, schema]
        }
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
