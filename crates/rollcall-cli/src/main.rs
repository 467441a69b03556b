use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::ImageFormat;
use rollcall_hw::{backend_for, list_devices, CaptureController, StillEncoding};
use std::path::{Path, PathBuf};
use zbus::proxy;

#[proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn create_classroom(&self, name: &str) -> zbus::Result<String>;
    fn list_classrooms(&self) -> zbus::Result<String>;
    fn add_student(&self, classroom_id: &str, name: &str, reg_no: &str) -> zbus::Result<()>;
    fn bind_account(&self, classroom_id: &str, reg_no: &str, account: &str) -> zbus::Result<()>;
    fn start_session(&self, classroom_id: &str) -> zbus::Result<String>;
    fn stop_session(&self) -> zbus::Result<bool>;
    fn capture(&self) -> zbus::Result<String>;
    fn marked(&self, classroom_id: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-verified attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage classrooms
    #[command(subcommand)]
    Classroom(ClassroomCommand),
    /// Manage enrolled students
    #[command(subcommand)]
    Student(StudentCommand),
    /// Start or stop the live attendance session
    #[command(subcommand)]
    Session(SessionCommand),
    /// Capture a frame and mark whoever is in it
    Capture,
    /// Show attendance records
    Marked {
        /// Classroom id (default: the running session's classroom)
        classroom: Option<String>,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Camera device path, or `synthetic`
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Where to write the captured still
        #[arg(short, long, default_value = "rollcall-test.jpg")]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = StillFormat::Jpeg)]
        format: StillFormat,
        /// Frames to discard before capturing
        #[arg(long, default_value_t = 4)]
        warmup: usize,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Subcommand)]
enum ClassroomCommand {
    /// Create a classroom
    Create { name: String },
    /// List classrooms
    List,
}

#[derive(Subcommand)]
enum StudentCommand {
    /// Enroll a student in a classroom
    Add {
        classroom: String,
        name: String,
        reg_no: String,
    },
    /// Bind a student's ledger account
    Bind {
        classroom: String,
        reg_no: String,
        account: String,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Open the camera and start marking a classroom
    Start { classroom: String },
    /// Stop the running session and release the camera
    Stop,
}

#[derive(Clone, Copy, ValueEnum)]
enum StillFormat {
    Jpeg,
    Png,
}

impl From<StillFormat> for ImageFormat {
    fn from(format: StillFormat) -> Self {
        match format {
            StillFormat::Jpeg => ImageFormat::Jpeg,
            StillFormat::Png => ImageFormat::Png,
        }
    }
}

async fn connect(system: bool) -> Result<AttendanceProxy<'static>> {
    let connection = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable; is the daemon running?")
}

fn print_json(json: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(json).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn camera_test(device: &str, output: &Path, format: StillFormat, warmup: usize) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let encoding = StillEncoding {
        format: format.into(),
        ..StillEncoding::default()
    };
    let mut controller = CaptureController::new(backend_for(device), device, encoding, warmup);
    controller.start().with_context(|| format!("failed to start {device}"))?;
    tracing::debug!(device, warmup, "camera started");
    let still = controller.capture_frame();
    controller.stop();
    let still = still.context("failed to capture a still")?;

    std::fs::write(output, &still.data)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "Captured {}x{} {} ({} bytes) -> {}",
        still.width,
        still.height,
        still.format.mime_type(),
        still.len(),
        output.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test {
            device,
            output,
            format,
            warmup,
        } => camera_test(&device, &output, format, warmup),
        Commands::Devices => {
            let devices = list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.card, dev.driver, dev.bus);
            }
            Ok(())
        }
        command => {
            let proxy = connect(cli.system).await?;
            daemon_command(&proxy, command).await
        }
    }
}

async fn daemon_command(proxy: &AttendanceProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Classroom(ClassroomCommand::Create { name }) => {
            print_json(&proxy.create_classroom(&name).await?)?;
        }
        Commands::Classroom(ClassroomCommand::List) => {
            print_json(&proxy.list_classrooms().await?)?;
        }
        Commands::Student(StudentCommand::Add {
            classroom,
            name,
            reg_no,
        }) => {
            proxy.add_student(&classroom, &name, &reg_no).await?;
            println!("Enrolled {name} ({reg_no}) in classroom {classroom}");
        }
        Commands::Student(StudentCommand::Bind {
            classroom,
            reg_no,
            account,
        }) => {
            proxy.bind_account(&classroom, &reg_no, &account).await?;
            println!("Bound {reg_no} to {account}");
        }
        Commands::Session(SessionCommand::Start { classroom }) => {
            print_json(&proxy.start_session(&classroom).await?)?;
        }
        Commands::Session(SessionCommand::Stop) => {
            if proxy.stop_session().await? {
                println!("Session stopped");
            } else {
                println!("No session was running");
            }
        }
        Commands::Capture => {
            let report: serde_json::Value = serde_json::from_str(&proxy.capture().await?)
                .context("daemon returned invalid JSON")?;
            let kind = report["kind"].as_str().unwrap_or("unknown");
            let message = report["message"].as_str().unwrap_or_default();
            println!("{kind}: {message}");
            if report["retriable"].as_bool() == Some(true) {
                println!("Capture again to retry.");
            }
            if report["expected"].as_bool() != Some(true) {
                bail!("attempt failed ({kind})");
            }
        }
        Commands::Marked { classroom } => {
            print_json(&proxy.marked(classroom.as_deref().unwrap_or_default()).await?)?;
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
        Commands::Test { .. } | Commands::Devices => bail!("command does not go through the daemon"),
    }

    Ok(())
}
