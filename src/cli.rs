use crate::{CaptureOptions, CaptureService, Config, DeviceClass};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

#[derive(Parser)]
#[command(name = "page-capture")]
#[command(about = "Headless web page capture with DOM and network inspection")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Maximum concurrent browser captures")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "Maximum concurrent sessions")]
    pub max_sessions: Option<usize>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture a single page
    Capture {
        #[arg(short, long, help = "URL to capture")]
        url: String,

        #[arg(short, long, help = "Output file path for the PNG")]
        output: PathBuf,

        #[arg(long, help = "Capture the full scrollable page")]
        full_page: bool,

        #[arg(long, default_value = "desktop", help = "Device class (desktop, tablet, phone)")]
        device: String,

        #[arg(long, help = "Viewport width, overrides the device preset")]
        width: Option<u32>,

        #[arg(long, help = "Viewport height, overrides the device preset")]
        height: Option<u32>,

        #[arg(long, default_value = "0", help = "Delay before capture in seconds (0-30)")]
        delay: u64,

        #[arg(long, help = "CSS selector to click once before capture")]
        click: Option<String>,

        #[arg(long, help = "Comma-separated CSS selectors to hide before capture")]
        hide: Option<String>,

        #[arg(long, help = "Also extract the rendered HTML")]
        grab_html: bool,

        #[arg(long, help = "Write the full capture result as JSON to this path")]
        report: Option<PathBuf>,
    },

    /// Validate a configuration file
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },

    /// Show pool, session and memory statistics for a fresh service
    Stats,
}

pub struct CliRunner {
    pub config: Config,
    pub service: Arc<CaptureService>,
}

impl CliRunner {
    pub fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let service = Arc::new(CaptureService::new(config.clone())?);
        Ok(Self { config, service })
    }

    pub async fn run(&self, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
        match command {
            Commands::Capture {
                url,
                output,
                full_page,
                device,
                width,
                height,
                delay,
                click,
                hide,
                grab_html,
                report,
            } => {
                let options = CaptureOptions {
                    url,
                    full_page,
                    device: parse_device(&device)?,
                    width,
                    height,
                    delay_secs: delay,
                    click,
                    hide,
                    grab_html,
                };
                self.run_capture(options, output, report).await
            }
            Commands::Validate { config } => self.validate_config(config).await,
            Commands::Stats => self.show_stats().await,
        }
    }

    async fn run_capture(
        &self,
        options: CaptureOptions,
        output: PathBuf,
        report: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        info!(url = %options.url, "capturing page");
        self.service.initialize().await?;

        let result = self.service.capture(&options).await?;

        let png = BASE64.decode(&result.screenshot)?;
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&output, &png).await?;

        println!("Capture complete:");
        println!("  URL: {}", options.url);
        println!("  Final URL: {}", result.final_url);
        println!("  Output: {}", output.display());
        println!(
            "  Size: {}",
            crate::utils::format_bytes(png.len() as u64)
        );
        println!("  Title: {}", result.dom_elements.title);
        println!("  Network requests: {}", result.network_logs.len());
        println!(
            "  Clickable elements: {}",
            result.dom_elements.clickable_elements.len()
        );

        if let Some(report_path) = report {
            let json = serde_json::to_vec_pretty(&result)?;
            fs::write(&report_path, json).await?;
            println!("  Report: {}", report_path.display());
        }

        self.service.shutdown().await;
        Ok(())
    }

    async fn validate_config(&self, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
        let content = fs::read_to_string(&path).await?;
        let config: Config = serde_json::from_str(&content)?;
        validate_config(&config)?;

        println!("Configuration is valid:");
        println!("  Max concurrent captures: {}", config.max_concurrent_captures);
        println!("  Max concurrent sessions: {}", config.max_concurrent_sessions);
        println!("  Session timeout: {:?}", config.session_timeout);
        println!(
            "  Cache: enabled={} smart={} ttl={:?}",
            config.cache.enabled, config.cache.smart, config.cache.ttl
        );
        println!(
            "  Prewarm: enabled={} count={}",
            config.prewarm_enabled, config.prewarm_count
        );
        Ok(())
    }

    async fn show_stats(&self) -> Result<(), Box<dyn std::error::Error>> {
        let stats = self.service.stats().await;

        println!("Service Statistics");
        println!("==================");
        println!("Pool:");
        println!("  Browser running: {}", stats.pool.browser_running);
        println!("  Active contexts: {}", stats.pool.active_contexts);
        println!("  Prewarmed contexts: {}", stats.pool.prewarm_contexts);
        println!("  Max contexts: {}", stats.pool.max_contexts);
        println!("Admission:");
        println!(
            "  Browser permits: {}/{}",
            stats.available_permits, stats.browser_cap
        );
        println!("Sessions:");
        println!("  Active: {}", stats.active_sessions);
        println!("Cache:");
        println!("  Entries: {}", stats.cache_entries);
        println!("Memory:");
        println!(
            "  {:.1}% used ({} MB of {} MB, {} MB available)",
            stats.memory.percent,
            stats.memory.used_mb,
            stats.memory.total_mb,
            stats.memory.available_mb
        );
        Ok(())
    }
}

fn parse_device(device: &str) -> Result<DeviceClass, String> {
    match device.to_lowercase().as_str() {
        "desktop" => Ok(DeviceClass::Desktop),
        "tablet" => Ok(DeviceClass::Tablet),
        "phone" | "mobile" => Ok(DeviceClass::Phone),
        other => Err(format!(
            "unknown device '{}', expected desktop, tablet or phone",
            other
        )),
    }
}

pub fn validate_config(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if config.max_concurrent_captures == 0 {
        return Err("max_concurrent_captures must be greater than 0".into());
    }
    if config.max_concurrent_sessions == 0 {
        return Err("max_concurrent_sessions must be greater than 0".into());
    }
    if config.session_timeout.as_secs() == 0 {
        return Err("session_timeout must be greater than 0".into());
    }
    if config.memory_critical_percent <= config.memory_warn_percent {
        return Err("memory_critical_percent must exceed memory_warn_percent".into());
    }
    if config.prewarm_enabled && config.prewarm_count == 0 {
        return Err("prewarm_count must be greater than 0 when prewarming is enabled".into());
    }
    Ok(())
}

pub fn setup_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
