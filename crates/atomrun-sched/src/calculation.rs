//! Calculation styles and the registry that resolves them.
//!
//! A job directory names its calculation style through a single input
//! script `calc_<style>.in`. The registry maps each style to the
//! [`Calculation`] that knows how to execute it.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{SchedError, SchedResult};

/// File receiving the captured output of a calculation.
pub const CALC_LOG: &str = "calc.log";

/// Default name of the results file a calculation leaves behind.
pub const DEFAULT_RESULTS_FILE: &str = "results.json";

/// Lines of stderr kept in the error message of a failed program.
pub const DIAGNOSTIC_LINES: usize = 40;

/// Outcome of executing a calculation.
#[derive(Debug, Clone, PartialEq)]
pub enum CalcOutcome {
    /// The calculation produced a results payload.
    Finished(Value),

    /// The calculation failed with a diagnostic message.
    Error(String),
}

impl CalcOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, CalcOutcome::Finished(_))
    }
}

/// An executable calculation style.
#[async_trait]
pub trait Calculation: Send + Sync {
    /// Calculation style name.
    fn style(&self) -> &str;

    /// Name of the results file inside the job directory.
    fn results_file(&self) -> &str {
        DEFAULT_RESULTS_FILE
    }

    /// Execute the calculation in `job_dir`. Failures of any kind are
    /// reported as [`CalcOutcome::Error`].
    async fn execute(&self, job_dir: &Path) -> CalcOutcome;
}

/// Input script name for a calculation style.
pub fn input_script(calc_style: &str) -> String {
    format!("calc_{calc_style}.in")
}

/// Determine the calculation style of a job directory from its input script.
///
/// Returns `Ok(None)` when the directory holds no input script.
pub async fn detect_calc_style(job_dir: &Path) -> SchedResult<Option<String>> {
    let mut entries = tokio::fs::read_dir(job_dir).await?;
    let mut styles = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(style) = name
            .strip_prefix("calc_")
            .and_then(|rest| rest.strip_suffix(".in"))
        {
            if !style.is_empty() {
                styles.push(style.to_string());
            }
        }
    }

    match styles.len() {
        0 => Ok(None),
        1 => Ok(styles.pop()),
        _ => {
            styles.sort();
            Err(SchedError::CalculationFailure(format!(
                "multiple input scripts in {}: {}",
                job_dir.display(),
                styles.join(", ")
            )))
        }
    }
}

/// Parse a results document left by a calculation.
///
/// An object with `"status": "error"` is an error outcome carrying its
/// `"error"` message; any other object is a finished payload.
pub fn parse_results(text: &str) -> CalcOutcome {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return CalcOutcome::Error(format!("malformed results: {e}")),
    };

    let Some(object) = value.as_object() else {
        return CalcOutcome::Error("malformed results: expected a JSON object".to_string());
    };

    if object.get("status").and_then(Value::as_str) == Some("error") {
        let message = object
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("calculation reported an error without a message");
        return CalcOutcome::Error(message.to_string());
    }

    CalcOutcome::Finished(value)
}

/// A calculation run by an external program.
///
/// The program is started in the job directory with the configured
/// arguments followed by the input script name.
#[derive(Debug, Clone)]
pub struct ScriptCalculation {
    style: String,
    program: String,
    args: Vec<String>,
    results_file: String,
    timeout: Option<Duration>,
}

impl ScriptCalculation {
    /// Create a calculation running `program` for `style`.
    pub fn new(style: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            style: style.into(),
            program: program.into(),
            args: Vec::new(),
            results_file: DEFAULT_RESULTS_FILE.to_string(),
            timeout: None,
        }
    }

    /// Arguments placed before the input script name.
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the results file name.
    pub fn with_results_file(mut self, results_file: impl Into<String>) -> Self {
        self.results_file = results_file.into();
        self
    }

    /// Kill the program if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, job_dir: &Path) -> SchedResult<CalcOutcome> {
        let input = input_script(&self.style);
        if !tokio::fs::try_exists(job_dir.join(&input)).await? {
            return Err(SchedError::CalculationFailure(format!(
                "missing input script {input}"
            )));
        }

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(&input)
            .current_dir(job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SchedError::CalculationFailure(format!("failed to start {}: {e}", self.program))
            })?;

        debug!("Started {} for {}", self.program, job_dir.display());

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Err(SchedError::CalculationFailure(format!(
                        "{} timed out after {}s",
                        self.program,
                        limit.as_secs_f64()
                    )));
                }
            },
            None => child.wait_with_output().await?,
        };

        let mut log = output.stdout.clone();
        log.extend_from_slice(&output.stderr);
        if let Err(e) = tokio::fs::write(job_dir.join(CALC_LOG), &log).await {
            warn!("Failed to write {} in {}: {}", CALC_LOG, job_dir.display(), e);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let status = format!("{} exited with {}", self.program, output.status);
            return Err(SchedError::CalculationFailure(match diagnostic_tail(&stderr) {
                Some(detail) => format!("{status}: {detail}"),
                None => status,
            }));
        }

        let results_path = job_dir.join(&self.results_file);
        match tokio::fs::read_to_string(&results_path).await {
            Ok(text) => Ok(parse_results(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SchedError::CalculationFailure(format!(
                    "no results file {} was produced",
                    self.results_file
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// The trailing lines of a failed program's stderr, at most
/// [`DIAGNOSTIC_LINES`] of them. `None` when stderr is blank.
fn diagnostic_tail(stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stderr.trim().lines().map(str::trim_end).collect();
    if lines.is_empty() {
        return None;
    }

    let skipped = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    let tail = lines[skipped..].join("\n");
    Some(if skipped > 0 {
        format!("[{skipped} earlier lines in {CALC_LOG}]\n{tail}")
    } else {
        tail
    })
}

#[async_trait]
impl Calculation for ScriptCalculation {
    fn style(&self) -> &str {
        &self.style
    }

    fn results_file(&self) -> &str {
        &self.results_file
    }

    async fn execute(&self, job_dir: &Path) -> CalcOutcome {
        match self.run(job_dir).await {
            Ok(outcome) => outcome,
            Err(SchedError::CalculationFailure(message)) => CalcOutcome::Error(message),
            Err(e) => CalcOutcome::Error(e.to_string()),
        }
    }
}

/// Calculation styles available to a runner.
#[derive(Clone, Default)]
pub struct CalculationRegistry {
    calculations: FxHashMap<String, Arc<dyn Calculation>>,
}

impl std::fmt::Debug for CalculationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationRegistry")
            .field("styles", &self.styles())
            .finish()
    }
}

impl CalculationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a calculation under its own style name.
    pub fn register(&mut self, calculation: Arc<dyn Calculation>) {
        self.calculations
            .insert(calculation.style().to_string(), calculation);
    }

    /// Builder form of [`CalculationRegistry::register`].
    pub fn with(mut self, calculation: impl Calculation + 'static) -> Self {
        self.register(Arc::new(calculation));
        self
    }

    /// Look up a calculation by style.
    pub fn get(&self, style: &str) -> SchedResult<Arc<dyn Calculation>> {
        self.calculations
            .get(style)
            .cloned()
            .ok_or_else(|| SchedError::UnknownCalculation(style.to_string()))
    }

    /// Registered style names, sorted.
    pub fn styles(&self) -> Vec<String> {
        let mut styles: Vec<_> = self.calculations.keys().cloned().collect();
        styles.sort();
        styles
    }

    pub fn is_empty(&self) -> bool {
        self.calculations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_results() {
        assert_eq!(
            parse_results(r#"{"energy": -4.45}"#),
            CalcOutcome::Finished(json!({"energy": -4.45}))
        );
        assert_eq!(
            parse_results(r#"{"status": "error", "error": "did not converge"}"#),
            CalcOutcome::Error("did not converge".to_string())
        );
        assert!(matches!(parse_results("[1, 2]"), CalcOutcome::Error(_)));
        assert!(matches!(parse_results("not json"), CalcOutcome::Error(_)));
    }

    #[tokio::test]
    async fn test_detect_calc_style() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_calc_style(dir.path()).await.unwrap(), None);

        tokio::fs::write(dir.path().join("calc_E_vs_r_scan.in"), "")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("potential.in"), "")
            .await
            .unwrap();
        assert_eq!(
            detect_calc_style(dir.path()).await.unwrap().as_deref(),
            Some("E_vs_r_scan")
        );

        tokio::fs::write(dir.path().join("calc_relax_box.in"), "")
            .await
            .unwrap();
        assert!(detect_calc_style(dir.path()).await.is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CalculationRegistry::new()
            .with(ScriptCalculation::new("E_vs_r_scan", "sh"))
            .with(ScriptCalculation::new("relax_box", "sh").with_results_file("out.json"));

        assert_eq!(registry.styles(), ["E_vs_r_scan", "relax_box"]);
        assert_eq!(registry.get("relax_box").unwrap().results_file(), "out.json");
        assert!(matches!(
            registry.get("phonon"),
            Err(SchedError::UnknownCalculation(_))
        ));
    }

    #[test]
    fn test_diagnostic_tail() {
        assert_eq!(diagnostic_tail(" \n\n"), None);
        assert_eq!(
            diagnostic_tail("ERROR: Lost atoms\nTotal wall time: 0:00:01\n").as_deref(),
            Some("ERROR: Lost atoms\nTotal wall time: 0:00:01")
        );

        let long: String = (0..DIAGNOSTIC_LINES + 5).map(|i| format!("line {i}\n")).collect();
        let tail = diagnostic_tail(&long).unwrap();
        assert!(tail.starts_with("[5 earlier lines in calc.log]\nline 5\n"));
        assert!(tail.ends_with(&format!("line {}", DIAGNOSTIC_LINES + 4)));
    }

    #[cfg(unix)]
    mod script {
        use super::*;

        async fn job_dir(style: &str) -> tempfile::TempDir {
            let dir = tempfile::tempdir().unwrap();
            tokio::fs::write(dir.path().join(input_script(style)), "")
                .await
                .unwrap();
            dir
        }

        fn shell(style: &str, script: &str) -> ScriptCalculation {
            // `sh -c <script> <input>` binds the input script name to $0.
            ScriptCalculation::new(style, "sh").with_args(["-c", script])
        }

        #[tokio::test]
        async fn test_script_finished() {
            let dir = job_dir("demo").await;
            let calc = shell("demo", r#"echo running $0; echo '{"energy": -3.5}' > results.json"#);

            let outcome = calc.execute(dir.path()).await;
            assert_eq!(outcome, CalcOutcome::Finished(json!({"energy": -3.5})));

            let log = tokio::fs::read_to_string(dir.path().join(CALC_LOG))
                .await
                .unwrap();
            assert!(log.contains("running calc_demo.in"));
        }

        #[tokio::test]
        async fn test_script_nonzero_exit() {
            let dir = job_dir("demo").await;
            let calc = shell("demo", "echo 'segmentation fault' >&2; exit 3");

            match calc.execute(dir.path()).await {
                CalcOutcome::Error(msg) => assert!(msg.contains("segmentation fault"), "{msg}"),
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_script_failure_keeps_cause() {
            let dir = job_dir("demo").await;
            let calc = shell(
                "demo",
                "echo 'ERROR: Lost atoms: original 500 current 498' >&2; \
                 echo 'Last command: run 10000' >&2; \
                 echo 'Total wall time: 0:00:01' >&2; exit 1",
            );

            match calc.execute(dir.path()).await {
                CalcOutcome::Error(msg) => {
                    assert!(msg.contains("ERROR: Lost atoms: original 500 current 498"), "{msg}");
                    assert!(msg.contains("Last command: run 10000"), "{msg}");
                    assert!(msg.ends_with("Total wall time: 0:00:01"), "{msg}");
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_script_reported_error() {
            let dir = job_dir("demo").await;
            let calc = shell(
                "demo",
                r#"echo '{"status": "error", "error": "lattice collapsed"}' > results.json"#,
            );
            assert_eq!(
                calc.execute(dir.path()).await,
                CalcOutcome::Error("lattice collapsed".to_string())
            );
        }

        #[tokio::test]
        async fn test_script_missing_results() {
            let dir = job_dir("demo").await;
            let calc = shell("demo", "true");
            assert!(matches!(calc.execute(dir.path()).await, CalcOutcome::Error(_)));
        }

        #[tokio::test]
        async fn test_script_timeout() {
            let dir = job_dir("demo").await;
            let calc = shell("demo", "sleep 30").with_timeout(Duration::from_millis(200));

            let started = std::time::Instant::now();
            match calc.execute(dir.path()).await {
                CalcOutcome::Error(msg) => assert!(msg.contains("timed out"), "{msg}"),
                other => panic!("unexpected outcome {other:?}"),
            }
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_missing_program() {
            let dir = job_dir("demo").await;
            let calc = ScriptCalculation::new("demo", "/nonexistent/atomrun-calc");
            match calc.execute(dir.path()).await {
                CalcOutcome::Error(msg) => assert!(msg.contains("failed to start"), "{msg}"),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }
}
