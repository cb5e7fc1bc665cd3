use clap::{Parser, Subcommand};
use pixelmill::config;
use pixelmill::identity::{Identity, Role, StaticIdentity};
use pixelmill::imaging::RustBackend;
use pixelmill::output;
use pixelmill::service::{Service, ServiceError};
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn version_string() -> &'static str {
    let on_tag = env!("ON_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "pixelmill")]
#[command(about = "Image transformation jobs, local stress runs, and a remote worker forwarder")]
#[command(long_about = "\
Image transformation jobs, local stress runs, and a remote worker forwarder

Upload an image once, then run operations on it:

  pixelmill --user alice upload ./cat.png
  pixelmill --user alice process cat.png --ops '{\"rotate\": 90, \"grayscale\": true}'
  pixelmill --user alice stress cat.png --duration 5
  pixelmill --user alice stress-remote cat.png --duration 5

Operations (applied once each, always in this order):
  rotate     degrees counter-clockwise, e.g. 45 or {\"angle\": 45, \"expand\": false}
  blur       sigma, e.g. 2.5
  resize     {\"width\": 640, \"height\": 480}
  upscale    factor, e.g. 2
  grayscale  true
  flip       \"horizontal\" or \"vertical\"

Run 'pixelmill gen-config' to generate a documented pixelmill.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file
    #[arg(long, default_value = config::CONFIG_FILE, env = "PIXELMILL_CONFIG", global = true)]
    config: PathBuf,

    /// Act as this user (unauthenticated when absent)
    #[arg(long, env = "PIXELMILL_USER", global = true)]
    user: Option<String>,

    /// Role of --user: admin or user
    #[arg(long, default_value = "user", env = "PIXELMILL_ROLE", global = true)]
    role: Role,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Service(ServiceCommand),
    /// Print a stock pixelmill.toml with all options documented
    GenConfig,
}

/// Commands that run against the configured stores and worker.
#[derive(Subcommand)]
enum ServiceCommand {
    /// Store an image for later processing
    Upload {
        file: PathBuf,
        /// Name to store it under (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Apply operations to an uploaded image once
    Process {
        filename: String,
        /// Operations as a JSON object
        #[arg(long, default_value = "{}")]
        ops: String,
    },
    /// Saturate every local core with a repeated workload
    Stress {
        filename: String,
        /// Window in seconds
        #[arg(long, default_value_t = 10)]
        duration: u64,
        /// Units to run, at most [stress] max_workers or one per core
        #[arg(long)]
        workers: Option<usize>,
        /// Repeat these operations instead of the stock mutation
        #[arg(long)]
        ops: Option<String>,
    },
    /// Send back-to-back heavy jobs to the remote worker
    StressRemote {
        filename: String,
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Let the remote worker run a process job
    Forward {
        filename: String,
        #[arg(long, default_value = "{}")]
        ops: String,
    },
    /// Let the remote worker run a whole stress job
    ForwardStress {
        filename: String,
        #[arg(long, default_value_t = 10)]
        duration: u64,
    },
    /// Probe the remote worker
    Health,
    /// Inspect and delete results
    #[command(subcommand)]
    Results(ResultsCommand),
    /// Inspect and delete uploads
    #[command(subcommand)]
    Uploads(UploadsCommand),
}

#[derive(Subcommand)]
enum ResultsCommand {
    /// List results you can see (admins see all)
    List,
    /// Show one result, optionally saving its image
    Get {
        output: String,
        /// Write the image here
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Delete one result
    Delete { output: String },
    /// Delete every result (admin only)
    Clear,
}

#[derive(Subcommand)]
enum UploadsCommand {
    /// List uploads you can see (admins see all)
    List,
    /// Delete one upload
    Delete { filename: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pixelmill=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
            return Ok(());
        }
        Command::Service(command) => command,
    };

    let config = config::load_config(&cli.config)?;
    let identity = StaticIdentity(cli.user.map(|user| Identity::new(user, cli.role)));
    let service = Service::from_config(RustBackend::new(), Box::new(identity), config)?;

    if let Err(e) = run(&service, command) {
        match e.downcast_ref::<ServiceError>() {
            Some(service_err) => eprintln!("{}", output::format_error(service_err)),
            None => eprintln!("Error: {e}"),
        }
        std::process::exit(1);
    }
    Ok(())
}

fn parse_ops(ops: &str) -> Result<Value, Box<dyn std::error::Error>> {
    serde_json::from_str(ops).map_err(|e| format!("--ops is not valid JSON: {e}").into())
}

fn run(
    service: &Service<RustBackend>,
    command: ServiceCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ServiceCommand::Upload { file, name } => {
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or("cannot derive a name from the file path; pass --name")?
                    .to_string(),
            };
            let bytes = std::fs::read(&file)?;
            let record = service.upload(&name, &bytes)?;
            output::print_upload(&record);
        }
        ServiceCommand::Process { filename, ops } => {
            let request = json!({"filename": filename, "operations": parse_ops(&ops)?});
            output::print_process(&service.process(&request)?);
        }
        ServiceCommand::Stress {
            filename,
            duration,
            workers,
            ops,
        } => {
            let mut request = json!({"filename": filename, "duration": duration});
            if let Some(workers) = workers {
                request["workers"] = json!(workers);
            }
            if let Some(ops) = ops {
                request["operations"] = parse_ops(&ops)?;
            }
            output::print_stress(&service.stress(&request)?);
        }
        ServiceCommand::StressRemote { filename, duration } => {
            let request = json!({"filename": filename, "duration": duration});
            output::print_remote_stress(&service.stress_remote(&request)?);
        }
        ServiceCommand::Forward { filename, ops } => {
            let request = json!({"filename": filename, "operations": parse_ops(&ops)?});
            output::print_forwarded(&service.forward(&request)?);
        }
        ServiceCommand::ForwardStress { filename, duration } => {
            let request = json!({"filename": filename, "duration": duration});
            output::print_forwarded(&service.forward_stress_job(&request)?);
        }
        ServiceCommand::Health => {
            let health = service.worker_health()?;
            output::print_health(&health);
            if !health.reachable {
                std::process::exit(2);
            }
        }
        ServiceCommand::Results(ResultsCommand::List) => {
            output::print_results(&service.list_results()?);
        }
        ServiceCommand::Results(ResultsCommand::Get { output: key, save }) => {
            let (record, bytes) = service.download_result(&key)?;
            output::print_results(std::slice::from_ref(&record));
            if let Some(path) = save {
                std::fs::write(&path, bytes)?;
                println!("Saved {}", path.display());
            }
        }
        ServiceCommand::Results(ResultsCommand::Delete { output: key }) => {
            service.delete_result(&key)?;
            println!("Deleted {key}");
        }
        ServiceCommand::Results(ResultsCommand::Clear) => {
            let n = service.clear_results()?;
            println!("Cleared {n} results");
        }
        ServiceCommand::Uploads(UploadsCommand::List) => {
            output::print_uploads(&service.list_uploads()?);
        }
        ServiceCommand::Uploads(UploadsCommand::Delete { filename }) => {
            service.delete_upload(&filename)?;
            println!("Deleted {filename}");
        }
    }
    Ok(())
}
