use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use c1x::{CompilationRequest, Compiler, CompilerConfig};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "c1x")]
#[command(about = "x86 code emitter for register-allocated LIR", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a method and print the target method
    Compile {
        /// JSON file holding the runtime model and the LIR method
        input: PathBuf,

        /// Compiler configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output format (human, json)
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormat,
    },
    /// Print the effective configuration
    Config {
        /// Compiler configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&Path>) -> Result<CompilerConfig, String> {
    match path {
        Some(path) => CompilerConfig::from_file(path).map_err(|e| e.to_string()),
        None => Ok(CompilerConfig::default()),
    }
}

fn compile(input: &Path, config: CompilerConfig, format: OutputFormat) -> Result<String, String> {
    let text = std::fs::read_to_string(input)
        .map_err(|e| format!("failed to read {}: {}", input.display(), e))?;
    let request: CompilationRequest = serde_json::from_str(&text)
        .map_err(|e| format!("invalid input {}: {}", input.display(), e))?;

    let compiler = Compiler::new(config, request.model);
    let method = compiler.compile(&request.method).map_err(|e| e.to_string())?;
    match format {
        OutputFormat::Human => Ok(method.trace_to_string(compiler.model())),
        OutputFormat::Json => serde_json::to_string_pretty(&method).map_err(|e| e.to_string()),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            input,
            config,
            format,
        } => load_config(config.as_deref()).and_then(|config| compile(&input, config, format)),
        Commands::Config { config } => load_config(config.as_deref())
            .and_then(|config| config.to_toml_string().map_err(|e| e.to_string())),
    };

    match result {
        Ok(output) => {
            println!("{}", output.trim_end());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
