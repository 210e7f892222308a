use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use schedule::{
    duration, AdType, Event, EventId, Interstitial, InterstitialKind, MoveRequest,
    MoveRequestBody, Reply, RetimeRequestBody, Run, RunId, Scheduler, SchedulerConfig,
};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use store::{default_db_path, ScheduleDb};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runsched")]
#[command(about = "Marathon run schedule: order runs, cascade start times, keep interstitials attached")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Database file (defaults to the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Scheduler settings as JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Orders locked per step when a cascade runs past the locked rows
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    chunk: Option<u32>,

    /// Leave order holes in place after a move
    #[arg(long, global = true)]
    no_normalize: bool,

    /// Milliseconds to wait for another writer before failing with a lock timeout
    #[arg(long, global = true)]
    lock_timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage events
    Event {
        #[command(subcommand)]
        command: EventCommand,
    },

    /// Manage runs
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },

    /// Attach an ad or interview to a run
    Interstitial {
        #[command(subcommand)]
        command: InterstitialCommand,
    },

    /// Move a run on its event's timeline
    Move {
        /// Run to move
        run: RunId,

        /// Place the run directly before this one
        #[arg(long)]
        before: Option<RunId>,

        /// Place the run directly after this one
        #[arg(long)]
        after: Option<RunId>,

        /// Target order, or "last"
        #[arg(long)]
        order: Option<String>,

        /// Take the run off the timeline
        #[arg(long)]
        unorder: bool,
    },

    /// Change a run's durations or anchor
    Retime {
        run: RunId,

        /// New run time, e.g. 1:25:00
        #[arg(long)]
        run_time: Option<String>,

        /// New setup time, e.g. 10:00
        #[arg(long)]
        setup_time: Option<String>,

        /// Pin the run's start to this instant (RFC 3339)
        #[arg(long)]
        anchor: Option<DateTime<Utc>>,

        #[arg(long)]
        clear_anchor: bool,
    },

    /// Close order holes and recompute every time of an event
    Normalize { event: EventId },

    /// Print an event's timeline
    Schedule { event: EventId },
}

#[derive(Subcommand)]
enum EventCommand {
    /// Create an event
    New {
        name: String,

        /// Broadcast start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,
    },

    /// List events
    List,
}

#[derive(Subcommand)]
enum RunCommand {
    /// Create an unordered run
    Add {
        #[arg(long)]
        event: EventId,

        name: String,

        /// e.g. 1:25:00
        #[arg(long)]
        run_time: String,

        #[arg(long, default_value = "0:00")]
        setup_time: String,

        /// Append the run to the end of the timeline
        #[arg(long)]
        last: bool,
    },

    /// List every run of an event
    List { event: EventId },
}

#[derive(Subcommand)]
enum InterstitialCommand {
    Ad {
        #[command(flatten)]
        slot: Slot,

        #[arg(long)]
        sponsor: String,

        #[arg(long)]
        ad_name: String,

        #[arg(long)]
        image: bool,
    },
    Interview {
        #[command(flatten)]
        slot: Slot,

        #[arg(long)]
        interviewers: String,

        #[arg(long, default_value = "")]
        topic: String,

        #[arg(long)]
        private: bool,
    },
}

#[derive(Args)]
struct Slot {
    /// Run the interstitial airs after
    #[arg(long)]
    run: RunId,

    /// e.g. 1:30
    #[arg(long)]
    length: String,

    /// Position among the run's interstitials (defaults to the next free one)
    #[arg(long)]
    suborder: Option<u32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    let path = cli.db.clone().unwrap_or_else(default_db_path);
    let db = ScheduleDb::open_or_create(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    if let Some(ms) = cli.lock_timeout_ms {
        db.set_busy_timeout(Duration::from_millis(ms))?;
    }
    let scheduler = Scheduler::with_config(db, config);
    debug!(path = %path.display(), config = ?scheduler.config(), "schedule database open");

    match cli.command {
        Commands::Event { command } => event_command(&scheduler, command),
        Commands::Run { command } => run_command(&scheduler, command),
        Commands::Interstitial { command } => interstitial_command(&scheduler, command),
        Commands::Move {
            run,
            before,
            after,
            order,
            unorder,
        } => emit(scheduler.handle_move(move_body(run, before, after, order, unorder))),
        Commands::Retime {
            run,
            run_time,
            setup_time,
            anchor,
            clear_anchor,
        } => emit(scheduler.handle_retime(RetimeRequestBody {
            run: Some(run),
            run_time,
            setup_time,
            anchor_time: anchor,
            clear_anchor,
        })),
        Commands::Normalize { event } => emit(Reply::from_result(scheduler.normalize_event(event))),
        Commands::Schedule { event } => match scheduler.schedule(event) {
            Ok(entries) => print_json(&entries),
            Err(err) => emit(Reply::error(&err)),
        },
    }
}

fn load_config(cli: &Cli) -> Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };
    if let Some(chunk) = cli.chunk {
        config.suffix_chunk = chunk;
    }
    if cli.no_normalize {
        config.normalize_after_move = false;
    }
    Ok(config)
}

fn event_command(scheduler: &Scheduler<ScheduleDb>, command: EventCommand) -> Result<()> {
    let db = scheduler.store();
    match command {
        EventCommand::New { name, start } => {
            let event = Event::new(name, start);
            db.insert_event(&event)?;
            info!(event = %event.id, "event created");
            print_json(&event)
        }
        EventCommand::List => print_json(&db.events()?),
    }
}

fn run_command(scheduler: &Scheduler<ScheduleDb>, command: RunCommand) -> Result<()> {
    let db = scheduler.store();
    match command {
        RunCommand::Add {
            event,
            name,
            run_time,
            setup_time,
            last,
        } => {
            let run = Run::new(
                event,
                name,
                duration::parse(&run_time).context("--run-time")?,
                duration::parse(&setup_time).context("--setup-time")?,
            );
            db.insert_run(&run)?;
            info!(run = %run.id, "run created");
            if last {
                emit(Reply::from_result(
                    scheduler.move_run(MoveRequest::to_last(run.id)),
                ))
            } else {
                print_json(&run)
            }
        }
        RunCommand::List { event } => print_json(&db.runs(event)?),
    }
}

fn interstitial_command(
    scheduler: &Scheduler<ScheduleDb>,
    command: InterstitialCommand,
) -> Result<()> {
    let (slot, kind) = match command {
        InterstitialCommand::Ad {
            slot,
            sponsor,
            ad_name,
            image,
        } => (
            slot,
            InterstitialKind::Ad {
                sponsor_name: sponsor,
                ad_name,
                ad_type: if image { AdType::Image } else { AdType::Video },
            },
        ),
        InterstitialCommand::Interview {
            slot,
            interviewers,
            topic,
            private,
        } => (
            slot,
            InterstitialKind::Interview {
                interviewers,
                topic,
                public: !private,
            },
        ),
    };

    let db = scheduler.store();
    let Some(anchor) = db.run(slot.run)? else {
        bail!("run {} does not exist", slot.run);
    };
    let suborder = match slot.suborder {
        Some(suborder) => suborder,
        None => next_suborder(&db.interstitials(anchor.event)?, anchor.id),
    };
    let length = duration::parse(&slot.length).context("--length")?;
    let item = Interstitial::new(&anchor, suborder, length, kind);
    db.insert_interstitial(&item)?;
    print_json(&item)
}

fn next_suborder(items: &[Interstitial], anchor: RunId) -> u32 {
    items
        .iter()
        .filter(|i| i.anchor == anchor)
        .map(|i| i.suborder)
        .max()
        .map_or(1, |max| max + 1)
}

/// Flags to the wire shape, so exclusivity is checked the same way as for
/// any other caller.
fn move_body(
    run: RunId,
    before: Option<RunId>,
    after: Option<RunId>,
    order: Option<String>,
    unorder: bool,
) -> MoveRequestBody {
    MoveRequestBody {
        moving: Some(run),
        before,
        after,
        order: order.map(|o| match o.parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(o),
        }),
        unorder,
    }
}

fn emit(reply: Reply) -> Result<()> {
    print_json(&reply.body)?;
    if !reply.is_success() {
        bail!("request failed with status {}", reply.status);
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
