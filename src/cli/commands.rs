//! CLI command implementations
//!
//! Each command loads configuration, builds what it needs, writes one JSON
//! response to stdout and returns. Logs go to stderr.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::auth::TokenRequest;
use crate::config::Config;
use crate::engine::EvaluationRequest;
use crate::eval::{MemoryTables, NoTables, TableSource};
use crate::harness::{Fixture, FixtureRunner};
use crate::observability::{init_logging, Event, ObservabilityError};
use crate::policy::{load_policy_file, PolicyRegistry};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{read_request, write_error, write_response, write_response_to};

/// Main CLI entry point
///
/// Parses arguments, loads configuration, installs logging and dispatches
/// to the appropriate command. This is the only function that main.rs
/// should call.
pub fn run() -> CliResult<()> {
    let cli = Cli::parse_args();
    let config = Config::load_or_default(cli.config.as_deref())?;

    match init_logging(&config.log_level, config.log_format) {
        Ok(()) | Err(ObservabilityError::AlreadyInstalled) => {}
        Err(e) => return Err(CliError::config_error(e.to_string())),
    }
    info!(
        event = Event::ConfigLoaded.as_str(),
        path = %cli.config.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        roles = config.roles.len(),
    );

    run_command(cli.command, &config)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command, config: &Config) -> CliResult<()> {
    match cmd {
        Command::Check { policies } => check(&policies),
        Command::Eval { policies, data } => eval(config, &policies, data.as_deref()),
        Command::Test { fixture, workers } => run_fixture(config, &fixture, workers),
        Command::Token {
            sub,
            role,
            email,
            aal,
        } => token(
            config,
            TokenRequest {
                sub,
                role,
                email,
                aal,
                ..TokenRequest::default()
            },
        ),
    }
}

/// Load a policy set into a fresh registry and report its state
pub fn check(policies: &Path) -> CliResult<()> {
    check_to(&mut io::stdout(), policies)
}

pub fn check_to<W: Write>(out: &mut W, policies: &Path) -> CliResult<()> {
    let registry = PolicyRegistry::new();
    let report = load_policy_file(policies)?.install(&registry)?;
    let snapshot = registry.snapshot();

    let tables: Vec<_> = snapshot
        .tables()
        .map(|t| {
            json!({
                "table": t.table,
                "enabled": t.enabled,
                "force": t.force,
                "policies": snapshot.policies_on(&t.table).count(),
            })
        })
        .collect();

    write_response_to(
        out,
        json!({
            "version": report.version,
            "changes": report.changes,
            "fingerprint": snapshot.fingerprint(),
            "tables": tables,
            "warnings": serde_json::to_value(&report.warnings)?,
        }),
    )
}

/// Evaluate a single request from stdin
///
/// Statement errors are reported as error responses, not process failures.
pub fn eval(config: &Config, policies: &Path, data: Option<&Path>) -> CliResult<()> {
    let registry = Arc::new(PolicyRegistry::new());
    load_policy_file(policies)?.install(&registry)?;

    let source: Arc<dyn TableSource> = match data {
        Some(path) => Arc::new(load_data(path)?),
        None => Arc::new(NoTables),
    };
    let engine = config.engine(registry, source)?;

    let request: EvaluationRequest = serde_json::from_value(read_request()?)
        .map_err(|e| CliError::io_error(format!("Invalid request: {}", e)))?;

    match engine.evaluate_request(&request) {
        Ok(report) => write_response(serde_json::to_value(&report)?),
        Err(e) => write_error(e.code(), &e.to_string()),
    }
}

/// Run a fixture; fails if any case mismatches
pub fn run_fixture(config: &Config, fixture: &Path, workers: Option<usize>) -> CliResult<()> {
    run_fixture_to(&mut io::stdout(), config, fixture, workers)
}

pub fn run_fixture_to<W: Write>(
    out: &mut W,
    config: &Config,
    fixture: &Path,
    workers: Option<usize>,
) -> CliResult<()> {
    let fixture = Fixture::load(fixture)?;
    let (engine, cases, _) = fixture.into_engine(config.resolver()?, config.engine_settings())?;

    let report = FixtureRunner::new(&engine)
        .with_workers(workers.unwrap_or(config.workers))
        .run(&cases);

    write_response_to(out, serde_json::to_value(&report)?)?;

    if report.is_success() {
        Ok(())
    } else {
        Err(CliError::test_failed(report.failed, report.total))
    }
}

/// Mint a token signed with the configured secret
pub fn token(config: &Config, request: TokenRequest) -> CliResult<()> {
    let resolver = config.resolver()?;
    if let Some(role) = &request.role {
        resolver.catalog().lookup(role)?;
    }

    let token = resolver.jwt().generate_token(request)?;
    write_response(json!({
        "token": token,
        "expiresIn": config.token_ttl_minutes * 60,
    }))
}

fn load_data(path: &Path) -> CliResult<MemoryTables> {
    let content = fs::read_to_string(path)
        .map_err(|e| CliError::io_error(format!("Failed to read data {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| CliError::io_error(format!("Invalid data JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn temp_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn response(out: Vec<u8>) -> Value {
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn test_check_reports_loaded_policies() {
        let file = temp_file(
            ".sql",
            "alter table todos enable row level security;
             create policy owner_read on todos for select using (auth.uid() = user_id);
             alter table notes enable row level security;",
        );
        let mut out = Vec::new();
        check_to(&mut out, file.path()).unwrap();

        let response = response(out);
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"]["version"], 1);
        assert_eq!(response["data"]["changes"], 3);
        assert_eq!(response["data"]["tables"][1]["table"], "todos");
        assert_eq!(response["data"]["tables"][1]["policies"], 1);
        assert_eq!(response["data"]["warnings"][0]["table"], "notes");
    }

    #[test]
    fn test_passing_fixture() {
        let file = temp_file(
            ".json",
            r#"{"tables": [{"table": "todos", "enabled": true}],
                "policies": [{"name": "read_own", "table": "todos", "command": "select",
                              "using": "auth.uid() = user_id"}],
                "data": {"todos": [{"id": 1, "user_id": "u1"}, {"id": 2, "user_id": "u2"}]},
                "cases": [{"name": "own rows", "table": "todos", "command": "select",
                           "role": "authenticated", "claims": {"sub": "u1"},
                           "expect": {"visible": 1}}]}"#,
        );
        let mut out = Vec::new();
        run_fixture_to(&mut out, &Config::default(), file.path(), None).unwrap();

        let response = response(out);
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"]["passed"], 1);
        assert_eq!(response["data"]["failed"], 0);
    }

    #[test]
    fn test_check_rejects_bad_policy() {
        let file = temp_file(".sql", "create policy p on todos for select with check (true);");
        let err = check(file.path()).unwrap_err();
        assert_eq!(err.code_str(), "RLS_CLI_POLICY_ERROR");
    }

    #[test]
    fn test_missing_policy_file() {
        let err = check(Path::new("/nonexistent/policies.sql")).unwrap_err();
        assert_eq!(err.code_str(), "RLS_CLI_IO_ERROR");
    }

    #[test]
    fn test_failing_fixture() {
        let file = temp_file(
            ".json",
            r#"{"tables": [{"table": "todos", "enabled": true}],
                "cases": [{"name": "deny by default", "table": "todos", "command": "select",
                           "role": "anon", "row": {"id": 1}, "expect": "allow"}]}"#,
        );
        let mut out = Vec::new();
        let err = run_fixture_to(&mut out, &Config::default(), file.path(), Some(2)).unwrap_err();
        assert_eq!(err.code_str(), "RLS_CLI_TEST_FAILED");
        assert_eq!(response(out)["data"]["failed"], 1);
    }

    #[test]
    fn test_token_unknown_role() {
        let err = token(
            &Config::default(),
            TokenRequest {
                role: Some("nobody".to_string()),
                ..TokenRequest::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.code_str(), "RLS_CLI_AUTH_ERROR");
    }
}
