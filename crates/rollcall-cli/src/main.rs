use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn create_person(
        &self,
        person_id: &str,
        name: &str,
        department: &str,
        term: u8,
        course: &str,
    ) -> zbus::Result<String>;
    async fn list_persons(&self, department: &str, query: &str) -> zbus::Result<String>;
    async fn delete_persons(&self, person_ids: Vec<String>) -> zbus::Result<u32>;
    async fn enroll(&self, person_id: &str, image: Vec<u8>) -> zbus::Result<u32>;
    async fn finalize_enrollment(&self, person_id: &str) -> zbus::Result<String>;
    async fn create_session(
        &self,
        department: &str,
        term: u8,
        subject: &str,
        course: &str,
        start_time: &str,
        duration_minutes: u32,
    ) -> zbus::Result<String>;
    async fn list_sessions(&self) -> zbus::Result<String>;
    async fn session_summary(&self, session_id: &str) -> zbus::Result<String>;
    async fn mark_attendance(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f64,
    ) -> zbus::Result<String>;
    async fn record_sighting(
        &self,
        session_id: &str,
        person_id: &str,
        display_name: &str,
        confidence: f64,
    ) -> zbus::Result<String>;
    async fn recognize(&self, image: Vec<u8>, session_id: &str) -> zbus::Result<String>;
    async fn list_unknowns(&self) -> zbus::Result<Vec<String>>;
    async fn assign_unknown(&self, file_name: &str, person_id: &str) -> zbus::Result<u32>;
    async fn delete_unknown(&self, file_name: &str) -> zbus::Result<bool>;
    async fn attendance_report(&self, range: &str, department: &str, term: u8, name: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new person
    AddPerson {
        /// Roll number
        person_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        department: String,
        /// Semester, 1-10
        #[arg(long)]
        term: u8,
        #[arg(long)]
        course: String,
    },
    /// List registered persons
    Persons {
        #[arg(long, default_value = "")]
        department: String,
        /// Substring of name or roll number
        #[arg(long, default_value = "")]
        query: String,
    },
    /// Delete persons and their enrolled faces
    RemovePersons {
        #[arg(required = true)]
        person_ids: Vec<String>,
    },
    /// Upload enrollment images for a person
    Enroll {
        person_id: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Mark enrollment complete after uploading
        #[arg(long)]
        finalize: bool,
    },
    /// Mark a person's enrollment complete
    Finalize { person_id: String },
    /// Create a class session
    StartSession {
        #[arg(long)]
        department: String,
        #[arg(long)]
        term: u8,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        course: String,
        /// RFC 3339, or local YYYY-MM-DDTHH:MM
        #[arg(long)]
        start: String,
        /// Length in minutes
        #[arg(long, default_value_t = 60)]
        duration: u32,
    },
    /// List current and recent sessions
    Sessions,
    /// Show a session and its live roster
    Session { session_id: String },
    /// Record attendance in the ledger
    Mark {
        session_id: String,
        person_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        confidence: f64,
    },
    /// Refresh a person's live roster entry
    Sighting {
        session_id: String,
        person_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        confidence: f64,
    },
    /// Identify the faces in an image
    Recognize {
        image: PathBuf,
        /// Refresh this session's roster for recognized faces
        #[arg(long, default_value = "")]
        session: String,
    },
    /// List unrecognized face thumbnails
    Unknowns,
    /// Add an unrecognized face to a person's gallery
    Assign { file_name: String, person_id: String },
    /// Discard an unrecognized face thumbnail
    Discard { file_name: String },
    /// Attendance ledger report
    Report {
        /// today, week, month or year
        #[arg(long, default_value = "today")]
        range: String,
        #[arg(long, default_value = "")]
        department: String,
        /// 0 for all terms
        #[arg(long, default_value_t = 0)]
        term: u8,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RollcallProxy::new(&conn).await?;
    tracing::debug!(system_bus = cli.system, "connected to rollcalld");

    match cli.command {
        Commands::AddPerson {
            person_id,
            name,
            department,
            term,
            course,
        } => {
            let reply = proxy.create_person(&person_id, &name, &department, term, &course).await?;
            print_json(&reply)?;
        }
        Commands::Persons { department, query } => {
            print_json(&proxy.list_persons(&department, &query).await?)?;
        }
        Commands::RemovePersons { person_ids } => {
            let removed = proxy.delete_persons(person_ids).await?;
            println!("Removed {removed} person(s)");
        }
        Commands::Enroll {
            person_id,
            images,
            finalize,
        } => {
            for path in &images {
                let bytes = read_image(path)?;
                match proxy.enroll(&person_id, bytes).await {
                    Ok(count) => println!("{}: accepted ({count} enrolled)", path.display()),
                    Err(e) => {
                        let detail = describe(&e);
                        println!("{}: {detail}", path.display());
                        if detail.starts_with("enrollment_aborted") {
                            anyhow::bail!("enrollment aborted; register {person_id} again");
                        }
                    }
                }
            }
            if finalize {
                print_json(&proxy.finalize_enrollment(&person_id).await?)?;
            }
        }
        Commands::Finalize { person_id } => {
            print_json(&proxy.finalize_enrollment(&person_id).await?)?;
        }
        Commands::StartSession {
            department,
            term,
            subject,
            course,
            start,
            duration,
        } => {
            let reply = proxy
                .create_session(&department, term, &subject, &course, &start, duration)
                .await?;
            print_json(&reply)?;
        }
        Commands::Sessions => print_json(&proxy.list_sessions().await?)?,
        Commands::Session { session_id } => print_json(&proxy.session_summary(&session_id).await?)?,
        Commands::Mark {
            session_id,
            person_id,
            name,
            confidence,
        } => {
            let reply = proxy.mark_attendance(&session_id, &person_id, &name, confidence).await?;
            print_json(&reply)?;
        }
        Commands::Sighting {
            session_id,
            person_id,
            name,
            confidence,
        } => {
            let reply = proxy.record_sighting(&session_id, &person_id, &name, confidence).await?;
            print_json(&reply)?;
        }
        Commands::Recognize { image, session } => {
            let bytes = read_image(&image)?;
            print_json(&proxy.recognize(bytes, &session).await?)?;
        }
        Commands::Unknowns => {
            let names = proxy.list_unknowns().await?;
            if names.is_empty() {
                println!("No unknown faces");
            }
            for name in names {
                println!("{name}");
            }
        }
        Commands::Assign { file_name, person_id } => {
            let count = proxy.assign_unknown(&file_name, &person_id).await?;
            println!("Assigned {file_name} to {person_id} ({count} enrolled)");
        }
        Commands::Discard { file_name } => {
            proxy.delete_unknown(&file_name).await?;
            println!("Deleted {file_name}");
        }
        Commands::Report {
            range,
            department,
            term,
            name,
        } => {
            let reply = proxy.attendance_report(&range, &department, term, &name).await?;
            print_json(&reply)?;
        }
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// The daemon's `reason: message` text, without the D-Bus error name.
fn describe(err: &zbus::Error) -> String {
    match err {
        zbus::Error::MethodError(_, Some(detail), _) => detail.clone(),
        other => other.to_string(),
    }
}
