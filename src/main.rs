//! Conclave - coordination for cooperating agent processes
//!
//! Main entry point for the Conclave CLI.

use clap::{Parser, Subcommand};
use conclave::broker::QueueEntry;
use conclave::config::{validate_config_result, ConclaveConfig};
use conclave::coordinator::{SubmitRequest, Task, TaskStatus};
use conclave::inbox::{DeliverRequest, Folder, Message, StatusFlag};
use conclave::notify::Notifier;
use conclave::{style, ConclaveError, Hub, Priority, Result};
use serde::Serialize;
use std::process;

/// Conclave - task coordination, priority queue and inboxes for agents
#[derive(Parser, Debug)]
#[command(name = "conclave")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/conclave/config.yaml)
    #[arg(short, long)]
    config: Option<String>,

    /// Identity of the calling agent
    #[arg(short, long, env = "CONCLAVE_AGENT", global = true)]
    agent: Option<String>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration and create the database
    Init,

    /// Manage agents
    #[command(subcommand)]
    Agent(AgentCommands),

    /// Submit and drive tasks
    #[command(subcommand)]
    Task(TaskCommands),

    /// Inspect and operate the priority queue
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Read and organize messages
    #[command(subcommand)]
    Inbox(InboxCommands),

    /// Run the heartbeat and queue sweeps
    Daemon {
        /// Push notifications into tmux sessions named after each agent
        #[arg(long)]
        tmux: bool,

        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },

    /// Print Prometheus metrics
    Metrics,
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// Register the calling agent
    Register {
        /// Declared capability (repeatable)
        #[arg(short = 'c', long = "capability")]
        capabilities: Vec<String>,
    },

    /// Report liveness for the calling agent
    Heartbeat,

    /// List agents
    List,

    /// Return an agent in error state to idle
    Reset { id: String },
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    /// Submit a new task
    Submit {
        description: String,

        /// low, normal, high, urgent or emergency
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Required capability (repeatable)
        #[arg(short = 'c', long = "capability")]
        capabilities: Vec<String>,

        /// Exclusive resource key
        #[arg(short, long)]
        resource: Option<String>,

        /// Agent that must take part (repeatable)
        #[arg(long = "candidate")]
        candidates: Vec<String>,

        /// Skip the approval gate
        #[arg(long)]
        approve: bool,
    },

    /// Claim the next queued task and start it
    Next,

    /// Start a pending task
    Start { id: String },

    /// Join an in-progress task
    Join { id: String },

    /// Report progress (0-100)
    Progress { id: String, percent: i64 },

    /// Report a result
    Complete {
        id: String,
        #[arg(short, long, default_value = "")]
        result: String,
    },

    /// Fail a task
    Fail {
        id: String,
        #[arg(short, long)]
        reason: String,
    },

    /// Show task status
    Status { id: String },

    /// List tasks
    List {
        /// pending, in_progress, completed or failed
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show recently finished tasks
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCommands {
    /// List live entries
    List,

    /// Show queue occupancy
    Stats,

    /// Approve a pending entry
    Approve { entry: i64 },

    /// Reject an entry and fail its task
    Reject {
        entry: i64,
        #[arg(short, long)]
        reason: String,
    },

    /// Claim the next entry without starting its task
    Dequeue,

    /// Acknowledge a processed entry
    Ack { entry: i64 },

    /// Record a failed attempt
    Nack {
        entry: i64,
        #[arg(short, long)]
        error: String,
    },

    /// List dead-lettered entries
    DeadLetters,

    /// Remove a dead-lettered entry
    Purge { entry: i64 },

    /// Show an entry's audit trail
    History { entry: i64 },
}

#[derive(Subcommand, Debug)]
enum InboxCommands {
    /// Send a message
    Send {
        /// Recipient mailbox
        #[arg(short, long)]
        to: String,

        #[arg(short, long)]
        subject: String,

        #[arg(short, long)]
        body: String,

        #[arg(long)]
        thread: Option<String>,

        #[arg(short, long, default_value = "normal")]
        priority: String,
    },

    /// List messages in a folder
    List {
        /// Folder name or id
        #[arg(short, long, default_value = "Inbox")]
        folder: String,
    },

    /// Show a message and mark it read
    Read { id: String },

    /// Set or clear a flag (read, starred, important, deleted)
    Flag {
        id: String,
        flag: String,
        #[arg(long)]
        off: bool,
    },

    /// Move a message to another folder
    Move { id: String, folder: String },

    /// Move a message to the archive
    Archive { id: String },

    /// Search subjects and bodies
    Search { query: String },

    /// List folders
    Folders,

    /// Create a folder
    Mkdir {
        name: String,
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Check folder counters against their messages
    Verify {
        /// Rewrite counters that drifted
        #[arg(long)]
        repair: bool,
    },
}

fn main() {
    // Initialize logging
    if let Err(e) = conclave::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("{} {}", style::error("Error:"), e);
        process::exit(1);
    }
}

fn load_config(path: &Option<String>) -> Result<ConclaveConfig> {
    let config = match path {
        Some(path) => ConclaveConfig::load(path)?,
        None => match ConclaveConfig::load_default() {
            Ok(config) => config,
            Err(ConclaveError::Config(msg)) if msg.contains("Config file not found") => {
                tracing::debug!("No config file, using defaults");
                ConclaveConfig::default()
            }
            Err(e) => return Err(e),
        },
    };
    validate_config_result(&config)?;
    Ok(config)
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Init = cli.command {
        return handle_init_command(&cli.config);
    }

    let config = load_config(&cli.config)?;
    let agent = cli.agent.as_deref();
    let json = cli.json;

    match cli.command {
        Commands::Init => Ok(()),
        Commands::Agent(cmd) => handle_agent_command(&Hub::open(&config)?, agent, cmd, json),
        Commands::Task(cmd) => handle_task_command(&Hub::open(&config)?, agent, cmd, json),
        Commands::Queue(cmd) => handle_queue_command(&Hub::open(&config)?, agent, cmd, json),
        Commands::Inbox(cmd) => handle_inbox_command(&Hub::open(&config)?, agent, cmd, json),
        Commands::Daemon { tmux, once } => handle_daemon_command(&config, tmux, once),
        Commands::Metrics => {
            print!("{}", conclave::metrics::encode_metrics()?);
            Ok(())
        }
    }
}

fn require_agent(agent: Option<&str>) -> Result<&str> {
    agent.filter(|a| !a.is_empty()).ok_or_else(|| {
        ConclaveError::Config("This command needs an agent id: pass --agent or set CONCLAVE_AGENT".to_string())
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn handle_init_command(path: &Option<String>) -> Result<()> {
    let config = ConclaveConfig::default();
    match path {
        Some(path) => config.save(path)?,
        None => config.save_default()?,
    }
    Hub::open(&config)?;

    let shown = path
        .clone()
        .unwrap_or_else(|| ConclaveConfig::default_path().display().to_string());
    println!("{} {}", style::success("Created"), shown);
    println!("Database: {}", config.store.path.display());
    Ok(())
}

fn handle_agent_command(
    hub: &Hub,
    agent: Option<&str>,
    cmd: AgentCommands,
    json: bool,
) -> Result<()> {
    match cmd {
        AgentCommands::Register { capabilities } => {
            let registered = hub.register_agent(require_agent(agent)?, &capabilities)?;
            if json {
                return print_json(&registered);
            }
            println!(
                "{} {} [{}]",
                style::success("Registered"),
                registered.id,
                registered.capabilities.join(", ")
            );
        }
        AgentCommands::Heartbeat => {
            let alive = hub.heartbeat(require_agent(agent)?)?;
            if json {
                return print_json(&alive);
            }
            println!("{} {}", alive.id, style::agent_status_style(alive.status));
        }
        AgentCommands::List => {
            let agents = hub.registry().list()?;
            if json {
                return print_json(&agents);
            }
            println!("{}", style::header(&format!("Agents ({})", agents.len())));
            for a in agents {
                println!(
                    "  {:<20} {:<8} {:<12} [{}] {}",
                    a.id,
                    style::agent_status_style(a.status),
                    a.current_task.as_deref().unwrap_or("-"),
                    a.capabilities.join(", "),
                    style::dim(&format!("last seen {}s ago", a.silence().num_seconds()))
                );
            }
        }
        AgentCommands::Reset { id } => {
            let reset = hub.registry().reset(&id)?;
            println!("{} {}", reset.id, style::agent_status_style(reset.status));
        }
    }
    Ok(())
}

fn print_task_summary(task: &Task) {
    println!(
        "{} {} {:<10} {:>3}% {}",
        style::task_status_indicator(task.status),
        style::id(&task.id),
        style::priority_style(task.priority),
        task.progress,
        task.description
    );
}

fn print_task_detailed(task: &Task) {
    println!("{}: {}", style::id(&task.id), task.description);
    println!("Status:       {}", style::task_status_style(task.status));
    println!("Priority:     {}", style::priority_style(task.priority));
    println!("Progress:     {}%", task.progress);
    if !task.capabilities.is_empty() {
        println!("Requires:     {}", task.capabilities.join(", "));
    }
    if let Some(key) = &task.resource_key {
        println!("Resource:     {}", key);
    }
    println!("Created:      {}", task.created_at);
    if let Some(at) = task.started_at {
        println!("Started:      {}", at);
    }
    if let Some(at) = task.completed_at {
        println!("Finished:     {}", at);
    }
    if let Some(error) = &task.error {
        println!("Error:        {}", style::error(error));
    }
    if !task.assignments.is_empty() {
        println!();
        println!("{}", style::header("Agents"));
        for a in &task.assignments {
            let state = match (&a.result, a.started) {
                (Some(_), _) => style::success("reported"),
                (None, true) => style::warning("working"),
                (None, false) => style::dim("waiting"),
            };
            println!("  {:<20} {:>3}% {}", a.agent_id, a.progress, state);
            if let Some(result) = &a.result {
                println!("    {}", result);
            }
        }
    }
}

fn handle_task_command(
    hub: &Hub,
    agent: Option<&str>,
    cmd: TaskCommands,
    json: bool,
) -> Result<()> {
    let task = match cmd {
        TaskCommands::Submit {
            description,
            priority,
            capabilities,
            resource,
            candidates,
            approve,
        } => {
            let mut req = SubmitRequest::new(description).with_priority(priority.parse::<Priority>()?);
            req.capabilities = capabilities;
            req.resource_key = resource;
            req.candidate_agents = candidates;
            req.auto_approve = approve;
            hub.submit_task(req)?
        }
        TaskCommands::Next => match hub.claim_next(require_agent(agent)?)? {
            Some((entry, task)) => {
                if !json {
                    println!("Claimed entry {}", style::id(&entry.id.to_string()));
                }
                task
            }
            None => {
                if json {
                    return print_json(&Option::<Task>::None);
                }
                println!("{}", style::dim("Nothing to do"));
                return Ok(());
            }
        },
        TaskCommands::Start { id } => hub.start_task(require_agent(agent)?, &id)?,
        TaskCommands::Join { id } => hub.join_task(require_agent(agent)?, &id)?,
        TaskCommands::Progress { id, percent } => {
            hub.report_progress(require_agent(agent)?, &id, percent)?
        }
        TaskCommands::Complete { id, result } => {
            hub.complete_task(require_agent(agent)?, &id, &result)?
        }
        TaskCommands::Fail { id, reason } => hub.fail_task(require_agent(agent)?, &id, &reason)?,
        TaskCommands::Status { id } => {
            if json {
                return print_json(&hub.get_task_status(&id)?);
            }
            print_task_detailed(&hub.coordinator().get_task(&id)?);
            return Ok(());
        }
        TaskCommands::List { status } => {
            let status = status.map(|s| s.parse::<TaskStatus>()).transpose()?;
            let tasks = hub.coordinator().list_tasks(status)?;
            if json {
                return print_json(&tasks);
            }
            println!("Found {} tasks:", tasks.len());
            println!();
            for task in &tasks {
                print_task_summary(task);
            }
            return Ok(());
        }
        TaskCommands::History { limit } => {
            let tasks = hub.coordinator().history(limit)?;
            if json {
                return print_json(&tasks);
            }
            for task in &tasks {
                print_task_summary(task);
            }
            return Ok(());
        }
    };

    if json {
        return print_json(&task);
    }
    print_task_summary(&task);
    Ok(())
}

fn print_entry(entry: &QueueEntry) {
    let mut line = format!(
        "{:>5} {} {:<10} {:<14} retries {}",
        style::id(&entry.id.to_string()),
        entry.task_id,
        style::priority_style(entry.priority),
        style::approval_style(entry.approval),
        entry.retry_count
    );
    if let Some(worker) = &entry.claimed_by {
        line.push_str(&format!(" claimed by {}", worker));
    }
    if let Some(error) = &entry.last_error {
        line.push_str(&format!(" {}", style::dim(error)));
    }
    println!("{}", line);
}

fn handle_queue_command(
    hub: &Hub,
    agent: Option<&str>,
    cmd: QueueCommands,
    json: bool,
) -> Result<()> {
    let broker = hub.broker();
    match cmd {
        QueueCommands::List => {
            let entries = broker.list()?;
            if json {
                return print_json(&entries);
            }
            entries.iter().for_each(print_entry);
        }
        QueueCommands::Stats => {
            let stats = broker.stats()?;
            if json {
                return print_json(&stats);
            }
            println!("{}", style::header("Queue"));
            println!("  Awaiting approval: {}", style::count_warning(stats.awaiting_approval));
            println!("  Ready:             {}", style::count_normal(stats.ready));
            println!("  Delayed:           {}", style::count_normal(stats.delayed));
            println!("  Claimed:           {}", style::count_normal(stats.claimed));
            println!("  Dead letters:      {}", style::count_warning(stats.dead_letters));
            println!("  Rejected:          {}", style::count_normal(stats.rejected));
        }
        QueueCommands::Approve { entry } => {
            print_entry(&hub.approve(require_agent(agent)?, entry)?);
        }
        QueueCommands::Reject { entry, reason } => {
            print_entry(&hub.reject(entry, &reason)?);
        }
        QueueCommands::Dequeue => match hub.dequeue(require_agent(agent)?)? {
            Some(entry) if json => return print_json(&entry),
            Some(entry) => print_entry(&entry),
            None => println!("{}", style::dim("Queue empty")),
        },
        QueueCommands::Ack { entry } => {
            hub.ack(entry)?;
            println!("{} {}", style::success("Acked"), entry);
        }
        QueueCommands::Nack { entry, error } => {
            let outcome = hub.nack(entry, &error)?;
            println!("{:?}", outcome);
        }
        QueueCommands::DeadLetters => {
            let entries = broker.dead_letters()?;
            if json {
                return print_json(&entries);
            }
            entries.iter().for_each(print_entry);
        }
        QueueCommands::Purge { entry } => {
            broker.purge_dead_letter(entry)?;
            println!("{} {}", style::success("Purged"), entry);
        }
        QueueCommands::History { entry } => {
            let events = broker.history(entry)?;
            if json {
                return print_json(&events);
            }
            for e in events {
                println!(
                    "{} {:<16} {}",
                    style::dim(&e.recorded_at.to_rfc3339()),
                    e.event,
                    e.detail.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

/// Folder by numeric id, or by name within the owner's tree
fn resolve_folder(hub: &Hub, owner: &str, name: &str) -> Result<Folder> {
    if let Ok(id) = name.parse::<i64>() {
        return hub.inbox().folder(id);
    }
    hub.inbox()
        .folders(owner)?
        .into_iter()
        .find(|f| f.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| ConclaveError::NotFound {
            entity: "folder",
            id: name.to_string(),
        })
}

fn print_message_summary(message: &Message) {
    let line = format!(
        "{} {:<16} {}  {}",
        style::id(&message.id),
        message.sender,
        message.subject,
        style::dim(&message.snippet)
    );
    if message.is_read {
        println!("  {}", line);
    } else {
        println!("* {}", style::unread(&line));
    }
}

fn handle_inbox_command(
    hub: &Hub,
    agent: Option<&str>,
    cmd: InboxCommands,
    json: bool,
) -> Result<()> {
    match cmd {
        InboxCommands::Send {
            to,
            subject,
            body,
            thread,
            priority,
        } => {
            let sender = require_agent(agent)?;
            let mut req = DeliverRequest::new(to, sender, subject, body)
                .with_priority(priority.parse::<Priority>()?)
                .copy_to_sent();
            if let Some(thread) = thread {
                req = req.with_thread(thread);
            }
            let id = hub.deliver_message(req)?;
            println!("{} {}", style::success("Sent"), style::id(&id));
        }
        InboxCommands::List { folder } => {
            let owner = require_agent(agent)?;
            let folder = resolve_folder(hub, owner, &folder)?;
            let messages = hub.inbox().list_folder(folder.id, false)?;
            if json {
                return print_json(&messages);
            }
            println!(
                "{} ({} messages, {} unread)",
                style::header(&folder.name),
                folder.message_count,
                folder.unread_count
            );
            messages.iter().for_each(print_message_summary);
        }
        InboxCommands::Read { id } => {
            let message = hub.inbox().get_message(&id)?;
            if !message.is_read {
                hub.update_status(&id, StatusFlag::Read, true)?;
            }
            if json {
                return print_json(&message);
            }
            println!("{}", style::header(&message.subject));
            println!("From:     {}", message.sender);
            println!("Date:     {}", message.sent_at);
            if let Some(thread) = &message.thread_id {
                println!("Thread:   {}", thread);
            }
            if !message.tags.is_empty() {
                println!("Tags:     {}", message.tags.join(", "));
            }
            println!();
            println!("{}", message.body);
        }
        InboxCommands::Flag { id, flag, off } => {
            hub.update_status(&id, flag.parse::<StatusFlag>()?, !off)?;
        }
        InboxCommands::Move { id, folder } => {
            let owner = hub.inbox().get_message(&id)?.owner;
            let folder = resolve_folder(hub, &owner, &folder)?;
            hub.move_message(&id, folder.id)?;
        }
        InboxCommands::Archive { id } => hub.archive(&id)?,
        InboxCommands::Search { query } => {
            let owner = require_agent(agent)?;
            let ids = hub.search(owner, &query)?;
            if json {
                return print_json(&ids);
            }
            for id in ids {
                print_message_summary(&hub.inbox().get_message(&id)?);
            }
        }
        InboxCommands::Folders => {
            let folders = hub.inbox().folders(require_agent(agent)?)?;
            if json {
                return print_json(&folders);
            }
            for f in folders {
                println!(
                    "{:>4} {:<20} {:>4} / {:<4} {}",
                    f.id,
                    f.name,
                    f.unread_count,
                    f.message_count,
                    style::dim(f.folder_type.as_str())
                );
            }
        }
        InboxCommands::Mkdir { name, parent } => {
            let owner = require_agent(agent)?;
            let parent = parent
                .map(|p| resolve_folder(hub, owner, &p).map(|f| f.id))
                .transpose()?;
            let folder = hub.inbox().create_folder(owner, &name, parent)?;
            println!("{} {} ({})", style::success("Created"), folder.name, folder.id);
        }
        InboxCommands::Verify { repair } => {
            let drift = hub.inbox().verify_counters()?;
            if json && !repair {
                return print_json(&drift);
            }
            if drift.is_empty() {
                println!("{}", style::success("All folder counters match"));
                return Ok(());
            }
            for d in &drift {
                println!(
                    "{} folder {}: total {} (actual {}), unread {} (actual {})",
                    style::warning("drift"),
                    d.folder_id,
                    d.stored_total,
                    d.actual_total,
                    d.stored_unread,
                    d.actual_unread
                );
            }
            if repair {
                let fixed = hub.inbox().rebuild_counters()?;
                println!("{} {} folders", style::success("Repaired"), fixed);
            }
        }
    }
    Ok(())
}

fn handle_daemon_command(config: &ConclaveConfig, tmux: bool, once: bool) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let mut hub = Hub::open(config)?;
        if tmux {
            hub = hub.with_notifier(Notifier::tmux(&config.notify)?);
        }

        let mut scheduler = hub.scheduler();
        if once {
            let report = scheduler.tick()?;
            println!(
                "offline: {}  affected: {}  requeued: {}  depth: {}",
                report.heartbeat.offline_agents.len(),
                report.heartbeat.affected_tasks.len(),
                report.requeued.len(),
                report.stats.depth()
            );
        } else {
            println!("{} (Ctrl+C to stop)", style::header("Conclave daemon running"));
            scheduler.run().await?;
        }

        if let Some(notifier) = hub.notifier() {
            notifier.drain().await;
        }
        Ok(())
    })
}
