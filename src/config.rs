use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Default)]
#[command(name = "texjob", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c', env = "TEXJOB_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Address the HTTP server binds to
    #[arg(long, env = "TEXJOB_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Port the HTTP server binds to
    #[arg(long, env = "PORT")]
    pub bind_port: Option<u16>,

    /// Compiler executable, e.g. `tectonic` or `pdflatex`
    #[arg(long, env = "LATEX_CMD")]
    pub compiler: Option<String>,

    /// Compiler arguments; `%INPUT%` and `%OUTPUT%` are replaced by the job's file names
    #[arg(
        long = "compiler-arg",
        env = "LATEX_ARGS",
        value_delimiter = ' ',
        allow_hyphen_values = true
    )]
    pub compiler_args: Option<Vec<String>>,

    /// Wall-clock bound of a single compilation, in milliseconds
    #[arg(long, env = "TEXJOB_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Directory under which per-job workspaces are created
    #[arg(long, env = "TEXJOB_JOB_ROOT")]
    pub job_root: Option<PathBuf>,

    /// HS256 secret used to verify bearer tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,
}

impl CliArgs {
    /// Load the configuration file (if any) and apply command line overrides
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(address) = &self.bind_address {
            config.server.bind_address = Some(address.clone());
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = Some(port);
        }

        match (&self.compiler, &self.compiler_args) {
            (Some(program), Some(args)) => {
                config.compiler.command = std::iter::once(program.clone())
                    .chain(args.iter().filter(|a| !a.is_empty()).cloned())
                    .collect();
            }
            (Some(program), None) => match config.compiler.command.first_mut() {
                Some(first) => *first = program.clone(),
                None => config.compiler.command = vec![program.clone()],
            },
            (None, Some(args)) => {
                config.compiler.command.truncate(1);
                config
                    .compiler
                    .command
                    .extend(args.iter().filter(|a| !a.is_empty()).cloned());
            }
            (None, None) => {}
        }

        if let Some(timeout) = self.timeout_ms {
            config.compiler.timeout = MilliSecond(timeout);
        }
        if let Some(root) = &self.job_root {
            config.jobs.root = Some(root.clone());
        }
        if let Some(secret) = &self.jwt_secret {
            config.auth.jwt_secret = Some(secret.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub compiler: CompilerConfig,
    pub jobs: JobConfig,
    pub auth: AuthConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("unable to open config file {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.compiler.command.is_empty() || self.compiler.command[0].trim().is_empty() {
            bail!("compiler command must name an executable");
        }
        if self.compiler.timeout.0 == 0 {
            bail!("compiler timeout must be greater than zero");
        }
        check_plain_file_name("compiler.input_file", &self.compiler.input_file)?;
        check_plain_file_name("compiler.output_file", &self.compiler.output_file)?;
        if self.compiler.input_file == self.compiler.output_file {
            bail!("compiler input and output files must differ");
        }
        if self.jobs.max_artifact_bytes == 0 {
            bail!("jobs.max_artifact_bytes must be greater than zero");
        }
        if self.auth.jwt_secret.as_deref().is_none_or(str::is_empty) {
            bail!("a JWT secret is required (set JWT_SECRET or auth.jwt_secret)");
        }
        Ok(())
    }
}

/// File names inside a workspace are fixed by configuration and may never point elsewhere
fn check_plain_file_name(field: &str, name: &str) -> anyhow::Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(()),
        _ => bail!("{field} must be a plain file name, got {name:?}"),
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    /// Upper bound of a request body, in bytes
    pub max_body_bytes: usize,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            bind_port: None,
            max_body_bytes: 1024 * 1024,
            workers: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompilerConfig {
    pub command: Vec<String>,
    pub input_file: String,
    pub output_file: String,
    pub timeout: MilliSecond,
    /// How long to wait for the output pipes to drain once the process is gone
    pub kill_grace: MilliSecond,
    /// Per-stream cap of captured compiler output, in bytes
    pub max_log_bytes: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            command: ["tectonic", "%INPUT%", "--outfmt", "pdf"]
                .map(String::from)
                .to_vec(),
            input_file: "main.tex".to_string(),
            output_file: "main.pdf".to_string(),
            timeout: MilliSecond(15_000),
            kill_grace: MilliSecond(2_000),
            max_log_bytes: 1024 * 1024,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JobConfig {
    pub root: Option<PathBuf>,
    pub max_artifact_bytes: u64,
    /// File name suggested to the client for a compiled document
    pub download_name: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_artifact_bytes: 50 * 1024 * 1024,
            download_name: "output.pdf".to_string(),
        }
    }
}

impl JobConfig {
    pub fn root_or_default(&self) -> PathBuf {
        if let Some(root) = &self.root {
            return root.clone();
        }

        use directories::ProjectDirs;

        match ProjectDirs::from("", "", "texjob") {
            Some(dirs) => dirs.cache_dir().join("jobs"),
            None => std::env::temp_dir().join("latex-jobs"),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    /// Clock skew tolerated when checking `exp`, in seconds
    pub leeway_secs: u64,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}
