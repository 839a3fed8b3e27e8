use clap::{Parser, ValueEnum};
use env_logger::Env;
use espforge_core::{BoardConfig, PlatformPaths};
use log::*;

use std::{
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    build::{build, merge},
    size::size,
    upload::{erase, upload},
};

mod build;
mod reporter;
mod size;
mod upload;

#[derive(Parser, Debug)]
enum Command {
    /// Convert the firmware ELF and lay out every flash image
    Build,
    /// Build, then write the flash layout to the board
    Upload {
        /// Upload the images of the previous build as they are
        #[clap(long)]
        no_build: bool,

        /// Erase the whole flash before writing
        #[clap(short, long)]
        erase: bool,

        /// Write only this filesystem image, at `upload.fs_offset`
        #[clap(long, value_name = "IMAGE", conflicts_with_all = ["erase", "no_build"])]
        filesystem: Option<PathBuf>,
    },
    /// Erase the whole flash chip
    Erase,
    /// Report program and data memory use of the firmware ELF
    Size,
    /// Combine the flash layout into one image written at address 0
    Merge {
        /// Output file, defaults to firmware.factory.bin in the build directory
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Merge the images of the previous build as they are
        #[clap(long)]
        no_build: bool,
    },
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None, author = "Jonathan Nilsson")]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Set the logging verbosity
    #[clap(short, long, value_enum, global = true, default_value_t = LogLevel::Info)]
    verbose: LogLevel,

    /// Board descriptor
    #[clap(short, long, global = true, default_value = "board.toml")]
    board: PathBuf,

    /// Root of the installed platform, holding `prebuilt/` and `packages/`
    #[clap(long, global = true, env = "ESPFORGE_PLATFORM_DIR", default_value = ".")]
    platform_dir: PathBuf,

    #[clap(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Build outputs, defaults to `.build` in the project directory
    #[clap(long, global = true)]
    build_dir: Option<PathBuf>,

    /// Firmware ELF produced by the toolchain, defaults to firmware.elf in the build directory
    #[clap(long, global = true)]
    elf: Option<PathBuf>,

    /// Python interpreter running esptool, espota and the partition generator
    #[clap(long, global = true, default_value = "python3")]
    python: PathBuf,

    /// Serial port or network address of the board
    #[clap(short = 'p', long, global = true, env = "UPLOAD_PORT")]
    upload_port: Option<String>,

    /// Overrides `upload.protocol` from the board descriptor
    #[clap(long, global = true, env = "UPLOAD_PROTOCOL")]
    upload_protocol: Option<String>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Off => LevelFilter::Off,
        }
    }
}

/// Everything a command needs, resolved once from the command line.
pub struct Context {
    pub board: BoardConfig,
    pub paths: PlatformPaths,
    pub elf: PathBuf,
    pub upload_port: Option<String>,
    pub upload_protocol: Option<String>,
    pub verbose: bool,
    pub abort: Arc<AtomicBool>,
}

impl Context {
    fn new(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        let board = BoardConfig::load(&cli.board)?;
        debug!("Loaded board '{}' from {}", board.name, cli.board.display());

        let build_dir = cli
            .build_dir
            .clone()
            .unwrap_or_else(|| cli.project_dir.join(".build"));
        let paths = PlatformPaths::new(&cli.platform_dir, &cli.project_dir, build_dir)
            .with_python(&cli.python);
        let elf = cli.elf.clone().unwrap_or_else(|| paths.firmware_elf());

        Ok(Self {
            board,
            paths,
            elf,
            upload_port: cli.upload_port.clone().filter(|port| !port.is_empty()),
            upload_protocol: cli.upload_protocol.clone().filter(|name| !name.is_empty()),
            verbose: cli.verbose >= LogLevel::Debug,
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn protocol_name(&self) -> &str {
        self.upload_protocol
            .as_deref()
            .unwrap_or_else(|| self.board.upload_protocol())
    }

    /// Ctrl-C cancels a wait for the upload port instead of killing the process mid-write.
    fn cancel_on_ctrlc(&self) -> Result<(), ctrlc::Error> {
        let abort = self.abort.clone();
        ctrlc::set_handler(move || abort.store(true, Ordering::SeqCst))
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default())
        .filter_level(cli.verbose.into())
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            let level = record.level();
            if level == Level::Info {
                writeln!(buf, "{}", record.args())
            } else {
                writeln!(buf, "{}: {}", record.level(), record.args())
            }
        })
        .init();

    let command = match &cli.command {
        Some(command) => command,
        None => return Ok(()),
    };

    let ctx = Context::new(&cli)?;

    match command {
        Command::Build => build(&ctx).map(|_| ()),
        Command::Upload {
            no_build,
            erase,
            filesystem,
        } => {
            ctx.cancel_on_ctrlc()?;
            upload(&ctx, *no_build, *erase, filesystem.as_deref())
        }
        Command::Erase => {
            ctx.cancel_on_ctrlc()?;
            erase(&ctx)
        }
        Command::Size => size(&ctx),
        Command::Merge { output, no_build } => merge(&ctx, output.as_deref(), *no_build),
    }
}
