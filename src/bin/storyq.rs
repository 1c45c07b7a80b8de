//! storyq CLI: run the dispatcher pool and operate on projects, shots, and
//! tasks.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use storyq::config::Config;
use storyq::config::secrets::ExposeSecret;
use storyq::db::{Db, PgmqQueue};
use storyq::engine::{ControlPlane, Dispatcher};
use storyq::model::{NewProject, Project, ProjectId, Shot, ShotId, Task, TaskId};
use storyq::producer::Producer;
use storyq::store::{ProjectStore, ShotStore, Store, TaskStore};
use storyq::telemetry::{TelemetryConfig, init_telemetry};
use storyq::worker::HttpWorkerClient;

#[derive(Parser)]
#[command(name = "storyq", about = "Storyboard generation task dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher pool
    Serve {
        /// Override POOL_SIZE
        #[arg(long)]
        pool_size: Option<usize>,
    },
    /// Project operations
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Shot operations
    Shot {
        #[command(subcommand)]
        action: ShotAction,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project
    Create {
        title: String,
        /// Story text to split into shots
        #[arg(long)]
        story: String,
        /// Visual style passed to the worker
        #[arg(long, default_value = "movie")]
        style: String,
    },
}

#[derive(Subcommand)]
enum ShotAction {
    /// Add an authored shot to a project
    Add {
        project_id: ProjectId,
        prompt: String,
        #[arg(long, default_value = "")]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Position within the project (defaults to the end)
        #[arg(long)]
        order: Option<u32>,
    },
    /// List a project's shots
    List { project_id: ProjectId },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Queue a storyboard task for a project
    Storyboard { project_id: ProjectId },
    /// Queue image generation for a shot
    Shot { shot_id: ShotId },
    /// Show a task
    Show { id: TaskId },
    /// List a project's tasks
    List { project_id: ProjectId },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    if let Command::Serve { pool_size } = cli.command {
        return cmd_serve(config, pool_size).await;
    }

    let db = Db::connect(config.database_url.expose_secret(), 2).await?;
    db.migrate().await?;

    match cli.command {
        Command::Serve { .. } => Ok(()),
        Command::Project { action } => match action {
            ProjectAction::Create {
                title,
                story,
                style,
            } => {
                let project = Project::from(NewProject {
                    title,
                    story_text: story,
                    style,
                });
                db.insert_project(&project).await?;
                println!("Created project: {}", project.id);
                Ok(())
            }
        },
        Command::Shot { action } => match action {
            ShotAction::Add {
                project_id,
                prompt,
                title,
                description,
                order,
            } => {
                let order = match order {
                    Some(order) => order,
                    None => db.list_shots(project_id).await?.len() as u32,
                };
                let mut shot = Shot::authored(project_id, order, prompt);
                shot.title = title;
                shot.description = description;
                db.insert_shot(&shot).await?;
                println!("Created shot: {} (order {})", shot.id, shot.order);
                Ok(())
            }
            ShotAction::List { project_id } => cmd_shot_list(&db, project_id).await,
        },
        Command::Task { action } => match action {
            TaskAction::Storyboard { project_id } => {
                let producer = producer(&db, &config).await?;
                let task = producer.submit_storyboard(project_id).await?;
                println!("Queued: {} (status: {})", task.id, task.status);
                Ok(())
            }
            TaskAction::Shot { shot_id } => {
                let producer = producer(&db, &config).await?;
                let task = producer.submit_shot_generation(shot_id).await?;
                println!("Queued: {} (status: {})", task.id, task.status);
                Ok(())
            }
            TaskAction::Show { id } => cmd_task_show(&db.get_task(id).await?),
            TaskAction::List { project_id } => cmd_task_list(&db, project_id).await,
        },
    }
}

async fn cmd_serve(mut config: Config, pool_size: Option<usize>) -> anyhow::Result<()> {
    if let Some(pool_size) = pool_size {
        anyhow::ensure!(pool_size > 0, "--pool-size must be at least 1");
        config.pool_size = pool_size;
    }

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "storyq".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    // One connection per slot plus the producer side and the listener.
    let db = Db::connect(
        config.database_url.expose_secret(),
        config.pool_size as u32 + 2,
    )
    .await?;
    db.migrate().await?;

    let queue = PgmqQueue::new(
        db.clone(),
        config.queue_name.clone(),
        config.visibility_timeout_secs,
    );
    queue.ensure().await?;
    let listener = queue.start_listener().await?;

    let worker = HttpWorkerClient::new(config.worker_url.clone(), config.worker_timeout)?;
    let store: Arc<dyn Store> = Arc::new(db);
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        Arc::new(worker),
        config.reconcile_config(),
    ));
    let control = ControlPlane::new(Arc::new(queue), dispatcher, config.control_config());

    let ctrl = control.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested, finishing in-flight deliveries");
        ctrl.shutdown();
    });

    control.run().await?;
    listener.abort();
    Ok(())
}

async fn producer(db: &Db, config: &Config) -> anyhow::Result<Producer> {
    let queue = PgmqQueue::new(
        db.clone(),
        config.queue_name.clone(),
        config.visibility_timeout_secs,
    );
    queue.ensure().await?;
    Ok(Producer::new(Arc::new(db.clone()), Arc::new(queue)))
}

async fn cmd_shot_list(db: &Db, project_id: ProjectId) -> anyhow::Result<()> {
    let shots = db.list_shots(project_id).await?;
    if shots.is_empty() {
        println!("No shots found.");
        return Ok(());
    }

    println!(
        "{:<5}  {:<8}  {:<10}  {:<30}  IMAGE",
        "ORDER", "ID", "STATUS", "TITLE"
    );
    println!("{}", "-".repeat(90));
    for shot in &shots {
        let short_id = &shot.id.to_string()[..8];
        let title: String = shot.title.chars().take(30).collect();
        println!(
            "{:<5}  {:<8}  {:<10}  {:<30}  {}",
            shot.order,
            short_id,
            shot.status,
            title,
            shot.image_path.as_deref().unwrap_or("-")
        );
    }
    println!("\n{} shot(s)", shots.len());
    Ok(())
}

async fn cmd_task_list(db: &Db, project_id: ProjectId) -> anyhow::Result<()> {
    let tasks = db.list_tasks(project_id).await?;
    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<15}  {:<10}  {:<3}  CREATED",
        "ID", "TYPE", "STATUS", "TRY"
    );
    println!("{}", "-".repeat(90));
    for task in &tasks {
        println!(
            "{:<36}  {:<15}  {:<10}  {:<3}  {}",
            task.id,
            task.task_type(),
            task.status,
            task.attempts,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

fn cmd_task_show(task: &Task) -> anyhow::Result<()> {
    println!("ID:         {}", task.id);
    println!("Project:    {}", task.project_id);
    println!("Type:       {}", task.task_type());
    if let Some(shot_id) = task.shot_id() {
        println!("Shot:       {shot_id}");
    }
    println!("Status:     {}", task.status);
    if task.retryable {
        println!("Retryable:  yes");
    }
    println!("Attempts:   {}", task.attempts);
    println!(
        "Params:     {}",
        serde_json::to_string_pretty(&task.payload.parameters()?)?
    );
    if let Some(ref url) = task.manifest_url {
        println!("Manifest:   {url}");
    }
    println!("Created:    {}", task.created_at);
    println!("Updated:    {}", task.updated_at);
    if let Some(ref result) = task.result {
        println!("---");
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref err) = task.error {
        println!("Error:      {err}");
    }
    Ok(())
}
