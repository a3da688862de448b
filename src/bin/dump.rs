//! `execore-dump` — a tiny demonstrator binary (§10.3). Unit-file parsing
//! stays out of scope; this just reads a JSON-encoded `ExecContext` from a
//! file or stdin and either prints the resolved plan or actually runs the
//! pipeline against it. Gives the core a runnable surface for manual
//! testing without pulling unit-parsing back into scope.
//!
//! Grounded on `rustysd`'s own `clap`-derived CLI style and on
//! `entrypoints::exec_helper`'s JSON-over-shared-memory `ExecHelperConfig`
//! idiom, generalised here to read from a plain file/stdin instead of an
//! anonymous shared-memory fd since there's no parent manager process to
//! hand one over.

use std::io::Read as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use execore::context::{ExecContext, ExecParameters};

#[derive(Parser)]
#[command(name = "execore-dump", about = "Inspect and exercise execore ExecContext plans")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a context and print the resolved identity, environment, and
    /// directory plan without executing anything.
    Dump {
        /// Path to a JSON-encoded ExecContext, or "-" for stdin.
        context: PathBuf,
    },
    /// Validate a context and then actually run the sandboxed pipeline.
    Run {
        /// Path to a JSON-encoded ExecContext, or "-" for stdin.
        context: PathBuf,
        /// Command to execve.
        cmd: String,
        /// Arguments (argv[1..]).
        args: Vec<String>,
    },
}

fn read_context(path: &PathBuf) -> Result<ExecContext, String> {
    let raw = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| format!("reading stdin failed: {e}"))?;
        buf
    } else {
        std::fs::read_to_string(path).map_err(|e| format!("reading {path:?} failed: {e}"))?
    };
    serde_json::from_str(&raw).map_err(|e| format!("parsing ExecContext failed: {e}"))
}

fn level_for(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = execore::log_setup::setup_logging(level_for(cli.verbose)) {
        eprintln!("warning: logging already initialized: {e}");
    }

    let result = match &cli.command {
        Command::Dump { context } => run_dump(context),
        Command::Run { context, cmd, args } => run_exec(context, cmd, args),
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run_dump(context_path: &PathBuf) -> Result<(), String> {
    let ctx = read_context(context_path)?;
    ctx.validate().map_err(|e| format!("invalid context: {e}"))?;

    let dynamic = if ctx.dynamic_user {
        let mut allocator = SequentialDynamicUserAllocator::default();
        Some(
            allocator
                .allocate("execore-dump", &[])
                .map_err(|e| format!("allocating dynamic user: {e}"))?,
        )
    } else {
        None
    };
    let identity = execore::identity::resolve(
        ctx.user.as_deref(),
        ctx.group.as_deref(),
        &ctx.supplementary_groups,
        dynamic,
    )
    .map_err(|e| format!("resolving identity: {e}"))?;

    println!("uid={} gid={}", identity.uid, identity.gid);
    println!("supplementary_gids={:?}", identity.supplementary_gids);
    println!("home={:?} shell={:?}", identity.home, identity.shell);

    for (class, config) in &ctx.directories {
        for item in &config.items {
            println!("directory[{class:?}] {:?} mode={:o}", item.path, config.mode);
        }
    }

    println!(
        "mount_namespace_needed={}",
        execore::namespace::needs_mount_namespace(&ctx, ctx.filesystem.private_tmp, ctx.dynamic_user)
    );

    Ok(())
}

struct NoopPam;
impl execore::sandbox::PamSession for NoopPam {
    fn open_session(&mut self, _service: &str, _uid: nix::unistd::Uid) -> execore::error::StepResult<()> {
        Ok(())
    }
    fn close_session(&mut self) -> execore::error::StepResult<()> {
        Ok(())
    }
}

struct NoopNamespace;
impl execore::namespace::NamespaceCollaborator for NoopNamespace {
    fn apply(
        &mut self,
        _bind_mounts: &[execore::namespace::CompiledBindMount],
        _symlinks: &[execore::namespace::CompiledSymlink],
    ) -> Result<(), execore::namespace::NamespaceCollaboratorError> {
        Ok(())
    }
}

/// A minimal in-memory `DynamicUserAllocator`: hands out uids/gids
/// sequentially from the systemd `DynamicUser=` range (61184-65519) with no
/// persistence or recycling across process restarts. Good enough to drive
/// the pipeline for manual testing; a real manager would persist
/// allocations keyed by unit name so restarts reuse the same id.
struct SequentialDynamicUserAllocator {
    next: u32,
}

impl Default for SequentialDynamicUserAllocator {
    fn default() -> Self {
        Self { next: 61184 }
    }
}

impl execore::identity::DynamicUserAllocator for SequentialDynamicUserAllocator {
    fn allocate(
        &mut self,
        _name: &str,
        _suggested_paths: &[PathBuf],
    ) -> execore::error::StepResult<execore::identity::DynamicIdentity> {
        let id = self.next;
        self.next += 1;
        Ok(execore::identity::DynamicIdentity {
            uid: nix::unistd::Uid::from_raw(id),
            gid: nix::unistd::Gid::from_raw(id),
        })
    }

    fn release(&mut self, _name: &str, _identity: execore::identity::DynamicIdentity) {}
}

fn run_exec(context_path: &PathBuf, cmd: &str, args: &[String]) -> Result<(), String> {
    let ctx = read_context(context_path)?;
    ctx.validate().map_err(|e| format!("invalid context: {e}"))?;

    let mut params = ExecParameters {
        unit_id: "execore-dump".to_string(),
        invocation_id: format!("{:032x}", std::process::id()),
        ..Default::default()
    };

    let mut decryption = execore::credentials::PassthroughBackend;
    let mut namespace = NoopNamespace;
    let mut pam = NoopPam;
    let mut dynamic_user = SequentialDynamicUserAllocator::default();
    let mut collaborators = execore::pipeline::Collaborators {
        pam: Some(&mut pam),
        namespace: &mut namespace,
        decryption: &mut decryption,
        dynamic_user: Some(&mut dynamic_user),
        lsm_filesystems: None,
    };

    // run_sandboxed_child forks no further processes itself: it either
    // execve's (never returns) or _exit()s on the first failing step, so
    // this call is the last thing this process does.
    execore::pipeline::run_sandboxed_child(&ctx, &mut params, cmd, args, &mut collaborators);
}
