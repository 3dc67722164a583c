//! The top-level entry point: flag parsing, log management, and driving
//! builds (including regenerating the manifest itself).

use crate::build::{self, BuildConfig, Builder, CommandRunner};
use crate::canon::canon_path;
use crate::command_log::CommandLog;
use crate::deps_log::DepsLog;
use crate::disk::SystemDisk;
use crate::graph::NodeId;
use crate::load;
use crate::status::{ConsoleStatus, Verbosity};
use crate::task::{DryRunCommandRunner, RealCommandRunner};
use crate::trace;
use anyhow::{anyhow, bail};

const COMMAND_LOG_PATH: &str = ".ninja_log";
const DEPS_LOG_PATH: &str = ".ninja_deps";

#[derive(argh::FromArgs)]
/// kiln: an incremental build system compatible with ninja manifests.
struct Opts {
    /// run from this directory instead of the current one
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// manifest to load [default=build.ninja]
    #[argh(option, short = 'f', default = "String::from(\"build.ninja\")")]
    manifest: String,

    /// cap on concurrently running commands [default: cpu count]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// stop after this many failing commands; 0 keeps going while progress
    /// is possible [default=1]
    #[argh(option, short = 'k', default = "1")]
    tolerate_failures: usize,

    /// plan and report without executing commands or writing logs
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// echo each command line as it starts
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// suppress progress output
    #[argh(switch)]
    quiet: bool,

    /// report the kiln version and exit
    #[argh(switch)]
    version: bool,

    /// enable a developer diagnostic; -d help lists them
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// run a maintenance tool; -t help lists them
    #[argh(option, short = 't')]
    tool: Option<String>,

    /// targets to bring up to date
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_job_count() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

/// Turn on one -d diagnostic.  Ok(false) means the request was only the
/// listing.
fn enable_debug(name: &str) -> anyhow::Result<bool> {
    match name {
        "trace" => {
            trace::open("trace.json")?;
            Ok(true)
        }
        "help" | "list" => {
            println!("diagnostics:");
            println!("  trace    write trace.json for a trace viewer");
            Ok(false)
        }
        _ => bail!("no diagnostic named {:?}; -d help lists them", name),
    }
}

fn run_tool(name: &str) -> anyhow::Result<i32> {
    match name {
        "help" | "list" => {
            println!("no tools are implemented yet");
            Ok(1)
        }
        _ => bail!("no tool named {:?}; -t help lists them", name),
    }
}

enum SessionOutcome {
    /// The manifest regenerated itself; reload and go again.
    Regenerated,
    /// Commands started, or None when everything was already up to date.
    Done(Option<usize>),
}

/// Load the manifest and logs, optionally refresh the manifest itself, then
/// build the requested targets.
fn build_session(
    opts: &Opts,
    config: &BuildConfig,
    status: &mut ConsoleStatus,
    allow_regen: bool,
) -> anyhow::Result<SessionOutcome> {
    let disk = SystemDisk;
    let mut loaded = trace::scope("load::read", || load::read(&opts.manifest, &disk))?;

    let mut command_log = CommandLog::new();
    trace::scope("command_log::load", || command_log.load(COMMAND_LOG_PATH))?;
    let mut deps_log = DepsLog::new();
    trace::scope("deps_log::load", || {
        deps_log.load(DEPS_LOG_PATH, &mut loaded.graph)
    })?;
    if !config.dry_run {
        command_log.open_for_write(COMMAND_LOG_PATH)?;
        deps_log.open_for_write(DEPS_LOG_PATH, &loaded.graph)?;
    }

    let mut real_runner;
    let mut dry_runner;
    let runner: &mut dyn CommandRunner = if config.dry_run {
        dry_runner = DryRunCommandRunner::new();
        &mut dry_runner
    } else {
        real_runner = RealCommandRunner::new(config.parallelism);
        &mut real_runner
    };

    // Decide what to build before the builder borrows the graph: explicit
    // targets, else the manifest's defaults, else every root output.
    let targets = if !opts.targets.is_empty() {
        ResolvedTargets::Names(opts.targets.clone())
    } else if !loaded.defaults.is_empty() {
        ResolvedTargets::Nodes(loaded.defaults.clone())
    } else {
        ResolvedTargets::Nodes(loaded.graph.roots())
    };
    let manifest_node = {
        let (path, _) = canon_path(&opts.manifest)?;
        loaded
            .graph
            .lookup_node(&path)
            .filter(|&node| loaded.graph.node(node).in_edge.is_some())
    };

    let mut builder = Builder::new(
        &mut loaded.graph,
        config,
        &disk,
        &mut command_log,
        &mut deps_log,
        status,
        runner,
    );

    // If the manifest is itself a build output, refresh it before trusting
    // its contents.
    if allow_regen {
        if let Some(node) = manifest_node {
            builder.add_target(node)?;
            if !builder.already_up_to_date()
                && trace::scope("build.regen", || builder.build())? > 0
            {
                return Ok(SessionOutcome::Regenerated);
            }
        }
    }

    if targets.is_empty() {
        // An empty manifest has nothing to build.
        return Ok(SessionOutcome::Done(None));
    }
    match targets {
        ResolvedTargets::Names(names) => {
            for name in names {
                builder.add_target_by_name(&name)?;
            }
        }
        ResolvedTargets::Nodes(nodes) => {
            for node in nodes {
                builder.add_target(node)?;
            }
        }
    }

    if builder.already_up_to_date() {
        return Ok(SessionOutcome::Done(None));
    }
    let started = trace::scope("build", || builder.build())?;
    Ok(SessionOutcome::Done(Some(started)))
}

enum ResolvedTargets {
    Names(Vec<String>),
    Nodes(Vec<NodeId>),
}

impl ResolvedTargets {
    fn is_empty(&self) -> bool {
        match self {
            ResolvedTargets::Names(names) => names.is_empty(),
            ResolvedTargets::Nodes(nodes) => nodes.is_empty(),
        }
    }
}

fn drive(opts: &Opts) -> anyhow::Result<i32> {
    if opts.version {
        println!("kiln {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }
    if let Some(name) = &opts.debug {
        if !enable_debug(name)? {
            return Ok(1);
        }
    }
    if let Some(name) = &opts.tool {
        return run_tool(name);
    }
    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let config = BuildConfig {
        parallelism: opts.jobs.unwrap_or_else(default_job_count),
        failures_allowed: opts.tolerate_failures,
        dry_run: opts.dry_run,
    };
    let mut status = ConsoleStatus::new(if opts.quiet {
        Verbosity::Quiet
    } else if opts.verbose {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    })?;

    build::install_interrupt_handler();

    // Build; when the manifest rewrites itself, reload and go again, this
    // time taking its contents at face value.
    let mut allow_regen = true;
    let commands_run = loop {
        match build_session(opts, &config, &mut status, allow_regen)? {
            SessionOutcome::Regenerated => allow_regen = false,
            SessionOutcome::Done(n) => break n,
        }
    };

    match commands_run {
        None => println!("kiln: everything is up to date."),
        Some(n) => println!(
            "kiln: finished {} command{}.",
            n,
            if n == 1 { "" } else { "s" }
        ),
    }
    Ok(0)
}

pub fn run() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();
    let result = drive(&opts);
    trace::close();
    result
}
