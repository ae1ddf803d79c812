use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use sau_core::browser::LaunchOverrides;
use sau_core::platforms::{DouyinOptions, ProductLink, Visibility, XiaohongshuOptions};
use sau_core::publish::{format_trace, LedgerError};
use sau_core::{
    load_publisher_config, parse_tags, tokio_clock, BrowserLauncher, ChromiumSessionFactory,
    ContentItem, ContentType, Platform, PlatformOptions, PublishReport, PublishTime, Publisher,
    PublisherConfig, RunLedger, RunRecord, SessionStatus,
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] sau_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("browser error: {0}")]
    Browser(#[from] sau_core::BrowserError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("content error: {0}")]
    Content(#[from] sau_core::ContentError),
    #[error("publish failed [{}]: {0}", .0.category())]
    Publish(#[from] sau_core::PublishError),
    #[error("session for {platform}/{account} is invalid: {reason}")]
    SessionInvalid {
        platform: String,
        account: String,
        reason: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Publishes media to creator platforms through a real browser", long_about = None)]
pub struct Cli {
    /// Path to publisher.toml
    #[arg(long, default_value = "configs/publisher.toml")]
    pub config: PathBuf,
    /// Override for paths.base_dir
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
    /// Override for paths.sessions_dir
    #[arg(long)]
    pub sessions_dir: Option<PathBuf>,
    /// Override for paths.diagnostics_dir
    #[arg(long)]
    pub diagnostics_dir: Option<PathBuf>,
    /// Run Chromium without a window
    #[arg(long, conflicts_with = "headed")]
    pub headless: bool,
    /// Run Chromium with a visible window
    #[arg(long)]
    pub headed: bool,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Douyin creator center
    #[command(alias = "dy")]
    Douyin(AccountArgs),
    /// Xiaohongshu creator center
    #[command(alias = "xhs")]
    Xiaohongshu(AccountArgs),
    /// Lists recent publish runs from the ledger
    History(HistoryArgs),
}

#[derive(Args, Debug)]
pub struct AccountArgs {
    /// Account name used to locate the stored session
    pub account: String,
    #[command(subcommand)]
    pub action: AccountCommands,
}

#[derive(Subcommand, Debug)]
pub enum AccountCommands {
    /// Publishes one video or image note
    Upload(UploadArgs),
    /// Checks that the stored session still grants authoring access
    CheckSession,
}

#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    /// Media files: one video, or up to nine images
    #[arg(required = true, num_args = 1..)]
    pub files: Vec<PathBuf>,
    /// Post title; defaults to the first file's stem
    #[arg(long)]
    pub title: Option<String>,
    /// Body text
    #[arg(long)]
    pub body: Option<String>,
    /// Tags separated by commas or whitespace
    #[arg(long)]
    pub tags: Option<String>,
    /// video or image
    #[arg(long)]
    pub content_type: Option<String>,
    /// Publish time as "YYYY-MM-DD HH:MM"; omitted means immediately
    #[arg(long)]
    pub schedule: Option<String>,
    /// Douyin shopping-cart link
    #[arg(long)]
    pub product_link: Option<String>,
    /// Short title for the Douyin product link
    #[arg(long, requires = "product_link")]
    pub product_title: Option<String>,
    /// Leave the Douyin Toutiao/Xigua sync switch untouched
    #[arg(long, default_value_t = false)]
    pub no_sync: bool,
    /// Declare the Xiaohongshu note as original content
    #[arg(long, default_value_t = false)]
    pub declare_original: bool,
    /// Xiaohongshu visibility: public or private
    #[arg(long)]
    pub visibility: Option<String>,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Number of runs returned
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Douyin(args) => context.account_command(Platform::Douyin, args, cli.format),
        Commands::Xiaohongshu(args) => {
            context.account_command(Platform::Xiaohongshu, args, cli.format)
        }
        Commands::History(args) => {
            let history = context.history(args)?;
            render(&history, cli.format)
        }
    }
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

/// Builds the content item for an upload from its arguments.
pub fn build_content(args: &UploadArgs) -> Result<ContentItem> {
    let title = match &args.title {
        Some(title) => title.clone(),
        None => args
            .files
            .first()
            .and_then(|path| path.file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    Ok(ContentItem {
        title,
        body: args.body.clone().filter(|body| !body.trim().is_empty()),
        tags: args.tags.as_deref().map(parse_tags).unwrap_or_default(),
        media: args.files.clone(),
        content_type: ContentType::normalize(args.content_type.as_deref()),
        publish_time: PublishTime::parse(args.schedule.as_deref())?,
    })
}

/// Builds the platform side-flow settings for an upload.
pub fn build_options(args: &UploadArgs) -> Result<PlatformOptions> {
    let product_link = match &args.product_link {
        Some(url) => Some(ProductLink {
            url: url.clone(),
            title: args.product_title.clone().unwrap_or_default(),
        }),
        None => None,
    };
    let visibility = match &args.visibility {
        Some(raw) => raw.parse::<Visibility>().map_err(AppError::InvalidArgument)?,
        None => Visibility::default(),
    };
    Ok(PlatformOptions {
        douyin: DouyinOptions {
            product_link,
            sync_third_party: !args.no_sync,
        },
        xiaohongshu: XiaohongshuOptions {
            declare_original: args.declare_original,
            visibility,
        },
    })
}

#[derive(Debug)]
struct AppContext {
    config: Arc<PublisherConfig>,
    overrides: LaunchOverrides,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_publisher_config(&cli.config)?;
        if let Some(dir) = &cli.base_dir {
            config.paths.base_dir = path_string(dir);
        }
        if let Some(dir) = &cli.sessions_dir {
            config.paths.sessions_dir = path_string(dir);
        }
        if let Some(dir) = &cli.diagnostics_dir {
            config.paths.diagnostics_dir = path_string(dir);
        }
        let headless = if cli.headless {
            Some(true)
        } else if cli.headed {
            Some(false)
        } else {
            None
        };
        Ok(Self {
            config: Arc::new(config),
            overrides: LaunchOverrides { headless },
        })
    }

    fn account_command(
        &self,
        platform: Platform,
        args: &AccountArgs,
        format: OutputFormat,
    ) -> Result<()> {
        match &args.action {
            AccountCommands::Upload(upload) => {
                let report = self.upload(platform, &args.account, upload)?;
                render(&report, format)
            }
            AccountCommands::CheckSession => {
                let check = self.check_session(platform, &args.account)?;
                render(&check, format)?;
                if check.valid {
                    Ok(())
                } else {
                    Err(AppError::SessionInvalid {
                        platform: check.platform,
                        account: check.account,
                        reason: check.reason.unwrap_or_default(),
                    })
                }
            }
        }
    }

    fn upload(&self, platform: Platform, account: &str, args: &UploadArgs) -> Result<PublishReport> {
        let content = build_content(args)?;
        let adapter = platform.adapter(&build_options(args)?);
        let publisher = self.publisher()?;
        info!(%platform, account, files = content.media.len(), "starting upload");
        let report = block_on(publisher.publish(adapter.as_ref(), account, &content))??;
        Ok(report)
    }

    fn check_session(&self, platform: Platform, account: &str) -> Result<SessionCheck> {
        let adapter = platform.adapter(&PlatformOptions::default());
        let publisher = self.publisher()?;
        let status = block_on(publisher.check_session(adapter.as_ref(), account))??;
        let session_path = publisher.sessions().path_for(platform.as_str(), account);
        let (valid, reason) = match status {
            SessionStatus::Valid => (true, None),
            SessionStatus::Invalid(reason) => (false, Some(reason)),
        };
        Ok(SessionCheck {
            platform: platform.to_string(),
            account: account.to_string(),
            valid,
            reason,
            session_path,
        })
    }

    fn history(&self, args: &HistoryArgs) -> Result<RunHistory> {
        let ledger = RunLedger::from_config(&self.config)?;
        let rows = ledger.recent(args.limit)?;
        Ok(RunHistory { rows })
    }

    fn publisher(&self) -> Result<Publisher> {
        let profiles = sau_core::ProfileManager::from_config(&self.config)?;
        let launcher = BrowserLauncher::new(Arc::clone(&self.config), profiles)
            .with_overrides(self.overrides.clone());
        let factory = Arc::new(ChromiumSessionFactory::new(launcher));
        let ledger = RunLedger::from_config(&self.config)?;
        Ok(Publisher::from_config(&self.config, factory, tokio_clock()).with_ledger(ledger))
    }
}

/// Runs one future to completion on a current-thread runtime; the browser
/// futures are not `Send`.
fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[derive(Debug, Serialize)]
pub struct SessionCheck {
    pub platform: String,
    pub account: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub session_path: PathBuf,
}

impl DisplayFallback for SessionCheck {
    fn display(&self) -> String {
        match &self.reason {
            None => format!(
                "{}/{}: session valid ({})",
                self.platform,
                self.account,
                self.session_path.display()
            ),
            Some(reason) => format!("{}/{}: session invalid: {reason}", self.platform, self.account),
        }
    }
}

impl DisplayFallback for PublishReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Published {}/{} in {} ms (run {})",
            self.platform, self.account, self.duration_ms, self.run_id
        )];
        lines.push(format!("  trace: {}", format_trace(&self.trace)));
        lines.push(format!(
            "  publish attempts: {} | retries: {} | fallback rate: {:.2}",
            self.publish_attempts,
            self.metrics.phase_retries,
            self.metrics.fallback_rate()
        ));
        if let Some(path) = &self.session_path {
            lines.push(format!("  session refreshed: {}", path.display()));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RunHistory {
    pub rows: Vec<RunRecord>,
}

impl DisplayFallback for RunHistory {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "No publish runs recorded".to_string();
        }
        let mut lines = Vec::new();
        for run in &self.rows {
            let outcome = if run.success {
                "ok".to_string()
            } else {
                run.category.clone().unwrap_or_else(|| "failed".to_string())
            };
            lines.push(format!(
                "{ts} {platform}/{account} [{content_type}] {title:?} {outcome} attempts={attempts} dur={dur}ms",
                ts = run.timestamp.format("%Y-%m-%d %H:%M:%S"),
                platform = run.platform,
                account = run.account,
                content_type = run.content_type,
                title = run.title,
                attempts = run.publish_attempts,
                dur = run.duration_ms,
            ));
            if let Some(path) = &run.diagnostics {
                lines.push(format!("    diagnostics: {}", path.display()));
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn prepare_test_context(command: Commands) -> (TempDir, Cli, AppContext) {
        let temp = TempDir::new().unwrap();
        let configs_dir = temp.path().join("configs");
        fs::create_dir_all(&configs_dir).unwrap();
        fs::copy("../configs/publisher.toml", configs_dir.join("publisher.toml")).unwrap();

        let cli = Cli {
            config: configs_dir.join("publisher.toml"),
            base_dir: Some(temp.path().to_path_buf()),
            sessions_dir: None,
            diagnostics_dir: None,
            headless: true,
            headed: false,
            format: OutputFormat::Json,
            command,
        };
        let context = AppContext::new(&cli).unwrap();
        (temp, cli, context)
    }

    fn upload_args(argv: &[&str]) -> UploadArgs {
        let mut full = vec!["sauctl", "douyin", "main", "upload"];
        full.extend_from_slice(argv);
        let cli = Cli::try_parse_from(full).unwrap();
        match cli.command {
            Commands::Douyin(AccountArgs {
                action: AccountCommands::Upload(args),
                ..
            }) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_platform_account_and_upload() {
        let cli = Cli::try_parse_from([
            "sauctl", "--format", "json", "xhs", "brand", "upload", "a.jpg", "b.jpg",
            "--content-type", "image", "--tags", "#旅行 #美食", "--declare-original",
        ])
        .unwrap();
        assert!(matches!(cli.format, OutputFormat::Json));
        let Commands::Xiaohongshu(args) = cli.command else {
            panic!("expected xiaohongshu command");
        };
        assert_eq!(args.account, "brand");
        let AccountCommands::Upload(upload) = args.action else {
            panic!("expected upload");
        };
        assert_eq!(upload.files.len(), 2);
        assert!(upload.declare_original);
    }

    #[test]
    fn upload_requires_files_and_rejects_conflicting_modes() {
        assert!(Cli::try_parse_from(["sauctl", "douyin", "main", "upload"]).is_err());
        assert!(Cli::try_parse_from([
            "sauctl", "--headless", "--headed", "douyin", "main", "check-session"
        ])
        .is_err());
        assert!(Cli::try_parse_from(["sauctl", "douyin", "main", "check-session"]).is_ok());
    }

    #[test]
    fn title_defaults_to_file_stem() {
        let content = build_content(&upload_args(&["/media/春日露营.mp4", "--tags", "露营,vlog"]))
            .unwrap();
        assert_eq!(content.title, "春日露营");
        assert_eq!(content.content_type, ContentType::Video);
        assert_eq!(content.tags, vec!["露营".to_string(), "vlog".to_string()]);
        assert!(content.publish_time.is_immediate());
    }

    #[test]
    fn malformed_schedule_is_rejected_before_publishing() {
        let err = build_content(&upload_args(&["a.mp4", "--schedule", "tomorrow"])).unwrap_err();
        assert!(matches!(err, AppError::Content(_)));

        let content =
            build_content(&upload_args(&["a.mp4", "--schedule", "2099-05-01 08:30"])).unwrap();
        assert!(content.publish_time.scheduled_at().is_some());
    }

    #[test]
    fn options_carry_side_flow_flags() {
        let options = build_options(&upload_args(&[
            "a.mp4",
            "--product-link",
            "https://haohuo.jinritemai.com/item/1",
            "--product-title",
            "露营椅",
            "--no-sync",
            "--visibility",
            "private",
        ]))
        .unwrap();
        let link = options.douyin.product_link.unwrap();
        assert_eq!(link.title, "露营椅");
        assert!(!options.douyin.sync_third_party);
        assert_eq!(options.xiaohongshu.visibility, Visibility::Private);

        let err = build_options(&upload_args(&["a.mp4", "--visibility", "friends"])).unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[test]
    fn history_lists_recorded_runs() {
        let (_temp, _cli, context) =
            prepare_test_context(Commands::History(HistoryArgs { limit: 5 }));
        assert!(context.history(&HistoryArgs { limit: 5 }).unwrap().rows.is_empty());

        let ledger = RunLedger::from_config(&context.config).unwrap();
        ledger
            .record(&RunRecord {
                timestamp: Utc::now(),
                run_id: "run-1".into(),
                platform: "douyin".into(),
                account: "main".into(),
                content_type: "video".into(),
                title: "春日露营".into(),
                success: false,
                category: Some("publish_timeout".into()),
                message: Some("publish not confirmed".into()),
                publish_attempts: 3,
                duration_ms: 90_000,
                trace: "navigate_entry[1x 10ms]".into(),
                diagnostics: None,
            })
            .unwrap();

        let history = context.history(&HistoryArgs { limit: 5 }).unwrap();
        assert_eq!(history.rows.len(), 1);
        let text = history.display();
        assert!(text.contains("douyin/main"));
        assert!(text.contains("publish_timeout"));
    }

    #[test]
    fn overrides_apply_to_config_paths() {
        let (temp, _cli, context) =
            prepare_test_context(Commands::History(HistoryArgs { limit: 1 }));
        assert_eq!(context.config.sessions_dir(), temp.path().join("sessions"));
        assert_eq!(context.overrides.headless, Some(true));
    }
}
