// Patch Atlas CLI binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use patch_atlas::config::{AtlasConfig, BackendPreference};
use patch_atlas::constants::{DEFAULT_SEARCH_LIMIT, ENV_BACKEND, ENV_DATA_DIR, ENV_LOG, ENV_PROVIDER};
use patch_atlas::library::{PatchFilter, PatchLibrary, PatchType};
use patch_atlas::midi::{to_hex, MidiTransport, Provider, ProviderKind};
use patch_atlas::plugins;
use patch_atlas::session::{
    ConnectOptions, DeviceSessionManager, ImportOptions, LogSink, VerificationState,
};

#[derive(Parser)]
#[command(name = "atlas")]
#[command(about = "Patch Atlas - a librarian for MIDI patches and plugin presets", long_about = None)]
#[command(version)]
struct Cli {
    /// Library folder (defaults to ~/.patch-atlas)
    #[arg(long, global = true, env = ENV_DATA_DIR)]
    data_dir: Option<PathBuf>,

    /// Storage backend: auto, sqlite or json
    #[arg(long, global = true, env = ENV_BACKEND)]
    backend: Option<BackendPreference>,

    /// MIDI provider: midi1 or virtual
    #[arg(long, global = true, env = ENV_PROVIDER)]
    provider: Option<ProviderKind>,

    /// Log filter (error, warn, info, debug, trace)
    #[arg(long, global = true, env = ENV_LOG, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show library location, backend and record counts
    Info,

    /// List MIDI ports
    Devices,

    /// Browse and manage patches
    Patches {
        #[command(subcommand)]
        command: PatchCommands,
    },

    /// Manage ordered patch sets
    Sets {
        #[command(subcommand)]
        command: SetCommands,
    },

    /// Capture SysEx dumps from a device and save them as patches
    Capture {
        /// Output port of the device
        #[arg(long)]
        output: String,
        /// Input port to listen on (defaults to the port with the same name)
        #[arg(long)]
        input: Option<String>,
        /// How long to listen
        #[arg(long, default_value = "30")]
        seconds: u64,
        /// Name prefix for the saved patches
        #[arg(long)]
        name: Option<String>,
        /// Extra tags for the saved patches
        #[arg(long = "tag")]
        tags: Vec<String>,
    },

    /// Send a stored patch to a device
    Send {
        /// Output port of the device
        #[arg(long)]
        output: String,
        /// Patch ID
        patch_id: String,
    },

    /// Scan and manage installed plugins
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },

    /// Knowledge documents
    Docs {
        #[command(subcommand)]
        command: DocCommands,
    },
}

#[derive(Subcommand)]
enum PatchCommands {
    /// List patches
    List {
        #[arg(long)]
        device: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// hardware or plugin
        #[arg(long = "type")]
        patch_type: Option<PatchType>,
        /// Substring of name or tag
        #[arg(short, long)]
        query: Option<String>,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Show patch details
    Show { id: String },
    /// Delete a patch
    Delete { id: String },
    /// Delete every patch and set
    Clear {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum SetCommands {
    /// List sets
    List {
        #[arg(long)]
        device: Option<String>,
    },
    /// Create a set
    Create {
        name: String,
        #[arg(long)]
        device: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Show a set and its patches in order
    Show { id: String },
    /// Append patches to a set
    Add {
        set_id: String,
        #[arg(required = true)]
        patch_ids: Vec<String>,
    },
    /// Renumber set members in the given order
    Reorder {
        set_id: String,
        #[arg(required = true)]
        patch_ids: Vec<String>,
    },
    /// Remove one patch from a set
    Remove { set_id: String, patch_id: String },
    /// Delete a set (patches are kept)
    Delete { id: String },
    /// Write a set and its patches to a JSON file
    Export { set_id: String, path: PathBuf },
    /// Import a set file under a device name
    Import {
        path: PathBuf,
        #[arg(long)]
        device: String,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// Scan plugin folders and record what is found
    Scan {
        /// Folders to scan (defaults to the platform plugin folders)
        #[arg(long = "dir")]
        dirs: Vec<PathBuf>,
    },
    /// List known plugins
    List,
    /// Set a plugin's manufacturer by hand
    SetVendor { id: String, manufacturer: String },
}

#[derive(Subcommand)]
enum DocCommands {
    /// Add a document
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        source: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Search documents
    Search {
        query: String,
        #[arg(long, default_value_t = DEFAULT_SEARCH_LIMIT)]
        limit: usize,
    },
    /// List documents, newest first
    List,
    /// Delete a document
    Delete { id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .parse_filters(&cli.log_level)
        .format_timestamp_millis()
        .init();

    let mut config = AtlasConfig::from_env();
    config.log_level = cli.log_level.clone();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(provider) = cli.provider {
        config.provider = provider;
    }

    match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Devices => cmd_devices(&config),
        Commands::Patches { command } => cmd_patches(&config, command),
        Commands::Sets { command } => cmd_sets(&config, command),
        Commands::Capture { output, input, seconds, name, tags } => {
            cmd_capture(&config, &output, input, seconds, name, tags)
        }
        Commands::Send { output, patch_id } => cmd_send(&config, &output, &patch_id),
        Commands::Plugins { command } => cmd_plugins(&config, command),
        Commands::Docs { command } => cmd_docs(&config, command),
    }
}

fn open_library(config: &AtlasConfig) -> Result<PatchLibrary> {
    std::fs::create_dir_all(&config.data_dir)?;
    Ok(PatchLibrary::open(config)?)
}

fn session_manager(config: &AtlasConfig) -> Result<DeviceSessionManager> {
    let transport = Provider::new(config.provider)?;
    let manager = DeviceSessionManager::new(Arc::new(transport), Arc::new(LogSink));
    manager.attach_library(Arc::new(open_library(config)?));
    Ok(manager)
}

fn cmd_info(config: &AtlasConfig) -> Result<()> {
    let library = open_library(config)?;
    let stats = library.stats()?;

    println!("Patch Atlas");
    println!();
    println!("Data folder:  {}", config.data_dir.display());
    println!("Backend:      {} (requested {})", stats.backend, config.backend);
    println!("MIDI:         {}", config.provider);
    println!();
    println!("Patches:      {}", stats.patches);
    println!("Sets:         {} ({} entries)", stats.patch_sets, stats.patch_set_items);
    println!("Plugins:      {}", stats.plugins);
    println!("Vendor cache: {}", stats.vendor_cache);
    println!("Docs:         {}", stats.knowledge_docs);

    Ok(())
}

fn cmd_devices(config: &AtlasConfig) -> Result<()> {
    let transport = Provider::new(config.provider)?;
    if !transport.query_supported() {
        anyhow::bail!("MIDI provider '{}' is not available on this machine", config.provider);
    }

    let ports = transport.discover()?;
    if ports.is_empty() {
        println!("No MIDI ports found.");
        return Ok(());
    }

    println!("{:>6}  {:<30}  {}", "Kind", "Name", "ID");
    println!("{}", "-".repeat(70));
    for port in ports {
        println!("{:>6}  {:<30}  {}", port.kind.to_string(), truncate(&port.name, 30), port.id);
    }

    Ok(())
}

fn cmd_patches(config: &AtlasConfig, command: PatchCommands) -> Result<()> {
    let library = open_library(config)?;

    match command {
        PatchCommands::List { device, category, patch_type, query, limit } => {
            let filter = PatchFilter {
                device,
                category,
                patch_type,
                query,
                limit: Some(limit),
            };
            let patches = library.list_patches(&filter)?;
            if patches.is_empty() {
                println!("No patches found. Use 'atlas capture' to import from a device.");
                return Ok(());
            }

            println!("{:<36}  {:<30}  {:<16}  {}", "ID", "Name", "Device", "Category");
            println!("{}", "-".repeat(100));
            for patch in patches {
                println!(
                    "{:<36}  {:<30}  {:<16}  {}",
                    patch.id,
                    truncate(&patch.name, 30),
                    truncate(&patch.device, 16),
                    patch.category
                );
            }
        }
        PatchCommands::Show { id } => {
            let patch = library.get_patch(&id)?;
            println!("Patch {}", patch.id);
            println!();
            println!("Name:        {}", patch.name);
            println!("Type:        {}", patch.patch_type);
            println!("Device:      {}", patch.device);
            if let Some(ref manufacturer) = patch.manufacturer {
                println!("Maker:       {}", manufacturer);
            }
            println!("Category:    {}", patch.category);
            if !patch.tags.is_empty() {
                println!("Tags:        {}", patch.tags.join(", "));
            }
            if let Some(ref sysex) = patch.sysex {
                let preview = &sysex[..sysex.len().min(16)];
                println!("SysEx:       {} bytes  {}...", sysex.len(), to_hex(preview));
            }
            if let Some(ref parameters) = patch.parameters {
                println!("Parameters:  {}", parameters.len());
            }
            if let Some(ref last_used) = patch.last_used {
                println!("Last used:   {}", last_used);
            }
            println!("Created:     {}", patch.created);
            println!("Modified:    {}", patch.modified);
        }
        PatchCommands::Delete { id } => {
            library.delete_patch(&id)?;
            println!("Deleted patch {}", id);
        }
        PatchCommands::Clear { yes } => {
            if !yes {
                anyhow::bail!("Refusing to delete every patch without --yes");
            }
            let removed = library.delete_all_patches()?;
            println!("Deleted {} patches and all sets", removed);
        }
    }

    Ok(())
}

fn cmd_sets(config: &AtlasConfig, command: SetCommands) -> Result<()> {
    let library = open_library(config)?;

    match command {
        SetCommands::List { device } => {
            let sets = library.list_sets(device.as_deref())?;
            if sets.is_empty() {
                println!("No sets found.");
                return Ok(());
            }
            println!("{:<36}  {:<30}  {}", "ID", "Name", "Device");
            println!("{}", "-".repeat(85));
            for set in sets {
                println!("{:<36}  {:<30}  {}", set.id, truncate(&set.name, 30), set.device);
            }
        }
        SetCommands::Create { name, device, description } => {
            let set = library.create_set(&name, &device, &description)?;
            println!("Created set '{}' ({})", set.name, set.id);
        }
        SetCommands::Show { id } => {
            let set = library.get_set(&id)?;
            let patches = library.get_items(&id)?;
            println!("Set '{}' for {}", set.name, set.device);
            if !set.description.is_empty() {
                println!("{}", set.description);
            }
            println!();
            for (i, patch) in patches.iter().enumerate() {
                println!("{:>3}. {}  ({})", i + 1, patch.name, patch.id);
            }
        }
        SetCommands::Add { set_id, patch_ids } => {
            let added = library.add_items(&set_id, &patch_ids)?;
            println!("Added {} of {} patches", added, patch_ids.len());
        }
        SetCommands::Reorder { set_id, patch_ids } => {
            let moved = library.reorder(&set_id, &patch_ids)?;
            println!("Reordered {} patches", moved);
        }
        SetCommands::Remove { set_id, patch_id } => {
            if library.remove_item(&set_id, &patch_id)? {
                println!("Removed {} from the set", patch_id);
            } else {
                println!("{} is not in the set", patch_id);
            }
        }
        SetCommands::Delete { id } => {
            library.delete_set(&id)?;
            println!("Deleted set {}", id);
        }
        SetCommands::Export { set_id, path } => {
            let export = library.export_set_to_file(&set_id, &path)?;
            println!(
                "Exported '{}' ({} patches) to {}",
                export.set.name,
                export.patches.len(),
                path.display()
            );
        }
        SetCommands::Import { path, device } => {
            let summary = library.import_set_from_file(&path, &device)?;
            println!("Imported set '{}' ({})", summary.set.name, summary.set.id);
            println!("  Imported: {}", summary.imported);
            println!("  Failed:   {}", summary.failed);
            for error in &summary.errors {
                println!("  - {}", error);
            }
            summary.into_result()?;
        }
    }

    Ok(())
}

fn cmd_capture(
    config: &AtlasConfig,
    output: &str,
    input: Option<String>,
    seconds: u64,
    name: Option<String>,
    tags: Vec<String>,
) -> Result<()> {
    let manager = session_manager(config)?;

    let status = manager.connect(output, ConnectOptions { input_id: input })?;
    println!(
        "Connected {} (listening on {})",
        status.output_id,
        status.input_id.as_deref().unwrap_or("-")
    );

    manager.start_import(output)?;
    println!("Capturing for {} s - send the dump from the device now...", seconds);
    std::thread::sleep(Duration::from_secs(seconds));
    let snapshot = manager.stop_import(output)?;
    println!("Captured {} SysEx messages", snapshot.count);

    if manager.status(output).state == VerificationState::Verified {
        println!("Device verified");
    }

    if snapshot.count == 0 {
        println!("Nothing to save.");
        return Ok(());
    }

    let options = ImportOptions {
        base_name: name,
        extra_tags: tags,
    };
    let summary = manager.save_import(output, &options)?;
    println!();
    println!("Capture saved:");
    println!("  Saved:   {}", summary.saved);
    println!("  Failed:  {}", summary.failed);
    summary.into_result()?;

    Ok(())
}

fn cmd_send(config: &AtlasConfig, output: &str, patch_id: &str) -> Result<()> {
    let manager = session_manager(config)?;
    manager.connect(output, ConnectOptions::default())?;
    let frames = manager.send_patch(output, patch_id)?;
    println!("Sent {} SysEx frames to {}", frames, output);
    Ok(())
}

fn cmd_plugins(config: &AtlasConfig, command: PluginCommands) -> Result<()> {
    let library = open_library(config)?;

    match command {
        PluginCommands::Scan { dirs } => {
            let dirs = if dirs.is_empty() { plugins::default_dirs() } else { dirs };
            println!("Scanning {} folders...", dirs.len());
            let found = plugins::scan_dirs(&dirs);
            let summary = library.record_scan(&found)?;
            println!();
            println!("Scan complete:");
            println!("  Found:    {}", summary.found);
            println!("  New:      {}", summary.added);
            println!("  Updated:  {}", summary.updated);
        }
        PluginCommands::List => {
            let plugins = library.list_plugins()?;
            if plugins.is_empty() {
                println!("No plugins recorded. Use 'atlas plugins scan'.");
                return Ok(());
            }
            println!("{:<36}  {:<28}  {:>5}  {}", "ID", "Name", "Type", "Manufacturer");
            println!("{}", "-".repeat(95));
            for plugin in plugins {
                println!(
                    "{:<36}  {:<28}  {:>5}  {}",
                    plugin.id,
                    truncate(&plugin.name, 28),
                    plugin.plugin_type,
                    plugin.manufacturer
                );
            }
        }
        PluginCommands::SetVendor { id, manufacturer } => {
            let plugin = library.set_plugin_manufacturer(&id, &manufacturer)?;
            println!("{} is now made by {}", plugin.name, plugin.manufacturer);
        }
    }

    Ok(())
}

fn cmd_docs(config: &AtlasConfig, command: DocCommands) -> Result<()> {
    let library = open_library(config)?;

    match command {
        DocCommands::Add { title, body, source, tags } => {
            let doc = library.add_doc(&title, &body, source.as_deref(), tags)?;
            println!("Added doc '{}' ({})", doc.title, doc.id);
        }
        DocCommands::Search { query, limit } => {
            let docs = library.search_docs(&query, limit)?;
            if docs.is_empty() {
                println!("No matching docs.");
                return Ok(());
            }
            for doc in docs {
                println!("{}  {}", doc.id, doc.title);
            }
        }
        DocCommands::List => {
            for doc in library.list_docs()? {
                let created = doc.created.split('T').next().unwrap_or(&doc.created);
                println!("{}  {:>10}  {}", doc.id, created, doc.title);
            }
        }
        DocCommands::Delete { id } => {
            library.delete_doc(&id)?;
            println!("Deleted doc {}", id);
        }
    }

    Ok(())
}

/// Shorten to `max` characters with a trailing ellipsis
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
