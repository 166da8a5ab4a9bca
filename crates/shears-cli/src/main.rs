use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use shears_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use shears_contracts::conversation::ImagePayload;
use shears_contracts::errors::{GenerationError, GenerationResult};
use shears_contracts::generation::GenerationRequest;
use shears_engine::config::{
    parse_modalities, parse_temperature, ClientConfig, DEFAULT_PROMPT_SUFFIX,
};
use shears_engine::{Exchange, GenerationClient, Session};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "shears-rs",
    version,
    about = "Conversational image generation and refinement"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Run(RunArgs),
    Refine(RefineArgs),
}

#[derive(Debug, Clone, Args)]
struct CommonArgs {
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    temperature: Option<f32>,
    #[arg(long)]
    max_dim: Option<u32>,
    /// Per-request timeout in seconds (15 to 300).
    #[arg(long)]
    timeout: Option<u64>,
    /// Response modalities, e.g. `TEXT` for chat-only models.
    #[arg(long)]
    modalities: Option<String>,
    /// Append the high-resolution suffix to every prompt.
    #[arg(long)]
    enhance: bool,
    #[arg(long)]
    no_resize: bool,
    #[arg(long)]
    no_refine: bool,
    #[arg(long)]
    no_regenerate: bool,
    /// Use the offline transport instead of the Gemini endpoint.
    #[arg(long)]
    dryrun: bool,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Debug, Parser)]
struct RefineArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    instruction: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    common: CommonArgs,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("shears-rs error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Run(args) => run_once(args),
        Command::Refine(args) => run_refine(args),
    }
}

impl CommonArgs {
    /// Defaults, `.env`, process environment, then these flags.
    fn client_config(&self) -> Result<ClientConfig> {
        let env_file = self.env_file.clone().or_else(|| {
            let local = PathBuf::from(".env");
            local.is_file().then_some(local)
        });
        let mut config = ClientConfig::load(env_file.as_deref())?;

        if let Some(model) = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            config.model = model.to_string();
        }
        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() {
                bail!("--temperature must be a number");
            }
            config.temperature = Some(temperature.clamp(0.0, 2.0));
        }
        if let Some(max_dim) = self.max_dim {
            config.max_image_dim = max_dim.clamp(64, 8192);
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout.clamp(15, 300);
        }
        if let Some(raw) = self.modalities.as_deref() {
            config.response_modalities = parse_modalities(raw)
                .with_context(|| format!("--modalities expects TEXT and/or IMAGE, got {raw}"))?;
        }
        if self.enhance && config.prompt_suffix.is_none() {
            config.prompt_suffix = Some(DEFAULT_PROMPT_SUFFIX.to_string());
        }
        if self.no_resize {
            config.features.resize = false;
        }
        if self.no_refine {
            config.features.refine = false;
        }
        if self.no_regenerate {
            config.features.regenerate = false;
        }
        Ok(config)
    }
}

fn build_client(config: ClientConfig, dryrun: bool) -> Arc<GenerationClient> {
    let client = if dryrun {
        GenerationClient::dryrun(config)
    } else {
        GenerationClient::gemini(config)
    };
    Arc::new(client)
}

fn open_session(
    out: &Path,
    events: Option<PathBuf>,
    common: &CommonArgs,
) -> Result<(Session, ClientConfig)> {
    fs::create_dir_all(out).with_context(|| format!("failed creating {}", out.display()))?;
    let config = common.client_config()?;
    let events_path = events.unwrap_or_else(|| out.join("events.jsonl"));
    let session = Session::new(
        build_client(config.clone(), common.dryrun),
        Some(events_path),
    );
    debug!(
        session = session.id(),
        model = %config.model,
        transport = session.client().transport_name(),
        "session ready"
    );
    Ok((session, config))
}

fn run_once(args: RunArgs) -> Result<()> {
    let (mut session, _) = open_session(&args.out, args.events.clone(), &args.common)?;
    let images = args
        .images
        .iter()
        .map(|path| ImagePayload::from_path(path))
        .collect::<GenerationResult<Vec<_>>>()?;
    let request = GenerationRequest::new(args.prompt.clone(), images);

    let exchange = session
        .submit(request)
        .map_err(|err| anyhow!(describe_error(&err)))?;
    let mut outputs = OutputDir::new(&args.out);
    outputs.report(&exchange)?;
    Ok(())
}

fn run_refine(args: RefineArgs) -> Result<()> {
    let (mut session, _) = open_session(&args.out, args.events.clone(), &args.common)?;
    let prior = ImagePayload::from_path(&args.image)?;
    let exchange = session
        .refine_image(&prior, &args.instruction)
        .map_err(|err| anyhow!(describe_error(&err)))?;
    let mut outputs = OutputDir::new(&args.out);
    outputs.report(&exchange)?;
    Ok(())
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let (mut session, mut config) = open_session(&args.out, args.events.clone(), &args.common)?;
    let dryrun = args.common.dryrun;
    let mut outputs = OutputDir::new(&args.out);
    let mut pending: Vec<ImagePayload> = Vec::new();
    let mut temperature: Option<f32> = None;

    let stdin = io::stdin();
    let mut line = String::new();

    println!("Shears chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        if intent.action == "noop" {
            continue;
        }

        match intent.action.as_str() {
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "quit" => break,
            "generate" => {
                let request = GenerationRequest::new(intent.prompt.clone(), pending.clone())
                    .with_temperature(temperature);
                if outputs.print_outcome(session.submit(request)) {
                    pending.clear();
                }
            }
            "send" => {
                if pending.is_empty() {
                    println!("/send needs attached images (use /attach)");
                    continue;
                }
                let request =
                    GenerationRequest::new(None, pending.clone()).with_temperature(temperature);
                if outputs.print_outcome(session.submit(request)) {
                    pending.clear();
                }
            }
            "attach" => {
                let paths = intent.arg_list("paths");
                if paths.is_empty() {
                    println!("/attach requires one or more image paths");
                    continue;
                }
                for path in paths {
                    match ImagePayload::from_path(Path::new(&path)) {
                        Ok(image) => {
                            println!("Attached {path} ({})", image.mime_type());
                            pending.push(image);
                        }
                        Err(err) => println!("Attach failed: {err}"),
                    }
                }
                println!("{} image(s) pending", pending.len());
            }
            "detach" => {
                let dropped = pending.len();
                pending.clear();
                println!("Dropped {dropped} pending image(s)");
            }
            "refine" => {
                let Some(instruction) = intent.arg_str("instruction") else {
                    println!("/refine requires an instruction");
                    continue;
                };
                outputs.print_outcome(session.refine(instruction));
            }
            "regenerate" => {
                outputs.print_outcome(session.regenerate());
            }
            "clear" => {
                session.clear();
                pending.clear();
                println!("Conversation cleared.");
            }
            "save_image" => {
                let target = intent
                    .arg_str("path")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| args.out.clone());
                match session.save_last_image(&target) {
                    Ok(path) => println!("Saved {}", path.display()),
                    Err(err) => println!("Save failed: {err:#}"),
                }
            }
            "history" => {
                if session.store().is_empty() {
                    println!("(no turns yet)");
                } else {
                    println!("{}", session.transcript());
                }
            }
            "set_temperature" => match intent.arg_str("temperature") {
                None => println!("Temperature: {}", temperature_label(temperature, &config)),
                Some(raw) if raw.eq_ignore_ascii_case("default") => {
                    temperature = None;
                    println!("Temperature: {}", temperature_label(temperature, &config));
                }
                Some(raw) => match parse_temperature(raw) {
                    Some(value) => {
                        temperature = Some(value);
                        println!("Temperature set to {value}");
                    }
                    None => println!("/temperature expects a number between 0 and 2"),
                },
            },
            "set_model" => {
                let Some(model) = intent.arg_str("model") else {
                    println!("Model: {}", config.model);
                    continue;
                };
                config.model = model.to_string();
                session.set_client(build_client(config.clone(), dryrun));
                println!("Model set to {model}");
            }
            "unknown" => {
                let command = intent.arg_str("command").unwrap_or_default();
                println!("Unknown command: /{command}. Type /help for commands.");
            }
            other => {
                println!("Unsupported action: {other}");
            }
        }
    }

    Ok(())
}

fn temperature_label(temperature: Option<f32>, config: &ClientConfig) -> String {
    match temperature.or(config.temperature) {
        Some(value) => value.to_string(),
        None => "model default".to_string(),
    }
}

/// One line a user can act on: auth and quota problems are called out so
/// they are not mistaken for a bad prompt.
fn describe_error(err: &GenerationError) -> String {
    match err {
        GenerationError::Transport(transport) if transport.is_auth() => {
            format!("authentication failed (check GEMINI_API_KEY): {transport}")
        }
        GenerationError::Transport(transport) if transport.is_quota() => {
            format!("quota exhausted, try again later: {transport}")
        }
        GenerationError::FeatureDisabled(feature) => {
            format!("{feature} is turned off for this session")
        }
        other => format!("{} error: {other}", other.label().replace('_', " ")),
    }
}

/// Writes returned images into the output directory with increasing names.
struct OutputDir {
    root: PathBuf,
    next_index: usize,
}

impl OutputDir {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            next_index: 1,
        }
    }

    fn next_path(&mut self, image: &ImagePayload) -> PathBuf {
        loop {
            let candidate = self.root.join(format!(
                "shears-{:03}.{}",
                self.next_index,
                image.format().extension()
            ));
            self.next_index += 1;
            if !candidate.exists() {
                return candidate;
            }
        }
    }

    fn report(&mut self, exchange: &Exchange) -> Result<Vec<PathBuf>> {
        for text in exchange.texts() {
            println!("{text}");
        }
        let mut saved = Vec::new();
        for image in exchange.images() {
            let path = self.next_path(image);
            image.save(&path)?;
            println!("Image saved: {}", path.display());
            saved.push(path);
        }
        Ok(saved)
    }

    /// Prints the outcome of a chat action. Returns whether it succeeded.
    fn print_outcome(&mut self, result: GenerationResult<Exchange>) -> bool {
        match result {
            Ok(exchange) => match self.report(&exchange) {
                Ok(_) => true,
                Err(err) => {
                    println!("Generated, but writing output failed: {err:#}");
                    true
                }
            },
            Err(err) => {
                println!("Generation failed: {}", describe_error(&err));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::Parser;
    use shears_contracts::conversation::{ImageFormat, ImagePayload};
    use shears_contracts::errors::{GenerationError, TransportError};
    use shears_contracts::generation::GenerationRequest;
    use shears_engine::config::{ClientConfig, DEFAULT_PROMPT_SUFFIX};
    use shears_engine::{GenerationClient, Session};

    use super::{describe_error, Cli, Command, OutputDir};

    #[test]
    fn cli_flags_override_config() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let env_file = temp.path().join(".env");
        std::fs::write(&env_file, "SHEARS_MODEL=from-dotenv\n")?;
        let cli = Cli::try_parse_from([
            "shears-rs",
            "run",
            "--prompt",
            "logo",
            "--out",
            "out",
            "--model",
            "gemini-2.5-flash-image",
            "--temperature",
            "9",
            "--max-dim",
            "512",
            "--timeout",
            "200",
            "--modalities",
            "text",
            "--enhance",
            "--no-resize",
            "--no-regenerate",
            "--dryrun",
            "--env-file",
            env_file.to_str().unwrap_or_default(),
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        let config = args.common.client_config()?;
        assert_eq!(config.model, "gemini-2.5-flash-image");
        assert_eq!(config.temperature, Some(2.0));
        assert_eq!(config.max_image_dim, 512);
        assert_eq!(config.request_timeout_secs, 200);
        assert_eq!(config.response_modalities, vec!["TEXT"]);
        if std::env::var("SHEARS_PROMPT_SUFFIX").is_err() {
            assert_eq!(config.prompt_suffix.as_deref(), Some(DEFAULT_PROMPT_SUFFIX));
        }
        assert!(!config.features.resize);
        assert!(config.features.refine);
        assert!(!config.features.regenerate);
        assert!(args.common.dryrun);
        Ok(())
    }

    #[test]
    fn unknown_modalities_are_rejected() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "shears-rs", "run", "--prompt", "logo", "--out", "out", "--modalities", "AUDIO",
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert!(args.common.client_config().is_err());
        Ok(())
    }

    #[test]
    fn run_accepts_repeated_images() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "shears-rs", "run", "--image", "a.png", "--image", "b.jpg", "--out", "out",
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert!(args.prompt.is_none());
        assert_eq!(args.images.len(), 2);
        Ok(())
    }

    #[test]
    fn errors_are_described_by_category() {
        let auth = GenerationError::from(TransportError::MissingCredential(
            "GEMINI_API_KEY".to_string(),
        ));
        assert!(describe_error(&auth).starts_with("authentication failed"));

        let quota = GenerationError::from(TransportError::Rejected {
            status: 429,
            body: "RESOURCE_EXHAUSTED".to_string(),
        });
        assert!(describe_error(&quota).starts_with("quota exhausted"));

        let invalid = GenerationError::invalid("nothing to send");
        assert!(describe_error(&invalid).starts_with("input validation error"));

        let disabled = GenerationError::FeatureDisabled("refine");
        assert_eq!(describe_error(&disabled), "refine is turned off for this session");
    }

    #[test]
    fn output_dir_names_do_not_collide() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        std::fs::write(temp.path().join("shears-001.png"), b"taken")?;
        let mut outputs = OutputDir::new(temp.path());
        let png = ImagePayload::new(vec![1, 2, 3], ImageFormat::Png);
        let jpeg = ImagePayload::new(vec![4, 5, 6], ImageFormat::Jpeg);
        assert_eq!(outputs.next_path(&png), temp.path().join("shears-002.png"));
        assert_eq!(outputs.next_path(&jpeg), temp.path().join("shears-003.jpg"));
        Ok(())
    }

    #[test]
    fn dryrun_exchange_is_written_to_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let client = GenerationClient::dryrun(ClientConfig::default());
        let mut session = Session::new(Arc::new(client), None);
        let exchange = session.submit(GenerationRequest::text("logo con tijeras"))?;
        let saved = OutputDir::new(temp.path()).report(&exchange)?;
        assert_eq!(saved.len(), 1);
        assert!(saved[0].exists());

        let mut outputs = OutputDir::new(temp.path());
        assert!(!outputs.print_outcome(session.refine("   ")));
        assert_eq!(session.store().len(), 3);
        Ok(())
    }
}
