use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use presstool_core::config::{PressConfig, load_config};
use presstool_core::mapper::{ColumnMapper, Field, LegacyRecord};
use presstool_core::media::{HttpMediaFetcher, HttpMediaFetcherConfig, MediaSettings};
use presstool_core::migrate::{current_version, latest_version, run_migrations};
use presstool_core::pipeline::{
    BatchOptions, BylineOptions, DEFAULT_BYLINE_META_KEY, ImportOptions, Migration,
    ShortcodeOptions, shortcode_marker,
};
use presstool_core::report::{ReportOptions, ReportSummary, Reporter};
use presstool_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready, init_layout, inspect_runtime, resolve_paths,
};
use presstool_core::sources::{SourceFormat, SourceOptions, read_records};
use presstool_core::store::SqliteSite;
use presstool_core::transform::ConverterRegistry;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "presstool",
    version,
    about = "Idempotent content migrations into a WordPress-shaped site database"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Debug-level logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Db(DbArgs),
    Import(ImportArgs),
    Content(ContentArgs),
    Authors(AuthorsArgs),
    Redirects(RedirectsArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing .presstool/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Stats,
    Migrate,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[command(subcommand)]
    command: ImportSubcommand,
}

#[derive(Debug, Subcommand)]
enum ImportSubcommand {
    #[command(about = "Create or update posts from a CSV, JSON, or XML export")]
    Posts(ImportPostsArgs),
}

#[derive(Debug, Args)]
struct ContentArgs {
    #[command(subcommand)]
    command: ContentSubcommand,
}

#[derive(Debug, Subcommand)]
enum ContentSubcommand {
    #[command(about = "Rewrite shortcodes in existing posts into blocks")]
    ConvertShortcodes(ConvertShortcodesArgs),
    #[command(about = "Build posts from component JSON exports")]
    ConvertComponents(ImportPostsArgs),
}

#[derive(Debug, Args)]
struct AuthorsArgs {
    #[command(subcommand)]
    command: AuthorsSubcommand,
}

#[derive(Debug, Subcommand)]
enum AuthorsSubcommand {
    #[command(about = "Split legacy byline meta into co-author assignments")]
    SplitBylines(SplitBylinesArgs),
}

#[derive(Debug, Args)]
struct RedirectsArgs {
    #[command(subcommand)]
    command: RedirectsSubcommand,
}

#[derive(Debug, Subcommand)]
enum RedirectsSubcommand {
    #[command(about = "Create redirect rules from source,target rows")]
    Import(RedirectsImportArgs),
}

#[derive(Debug, Args)]
struct SourceArgs {
    path: PathBuf,
    #[arg(long, value_name = "csv|json|xml")]
    format: Option<String>,
    #[arg(long, value_name = "COLUMN", help = "Column holding the original id")]
    id_column: Option<String>,
    #[arg(long, value_name = "NAME", help = "Repeated XML element holding one record")]
    item_element: Option<String>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long, help = "Log what would change without writing")]
    dry_run: bool,
    #[arg(long, value_name = "PATH", help = "Write the CSV QA report to PATH")]
    csv_report: Option<PathBuf>,
    #[arg(long, help = "Skip the CSV QA report")]
    no_csv: bool,
}

#[derive(Debug, Args)]
struct BatchArgs {
    #[arg(long = "post-type", value_name = "TYPE", default_value = "post")]
    post_types: Vec<String>,
    #[arg(long, value_name = "N", help = "Posts per page (default from config)")]
    batch: Option<usize>,
    #[arg(long, value_name = "ID")]
    post_id: Option<i64>,
    #[arg(long, value_name = "ID", help = "Resume from this post id")]
    min_post_id: Option<i64>,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ImportPostsArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[arg(long, default_value = "post")]
    post_type: String,
    #[arg(long, default_value = "publish")]
    status: String,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    #[arg(long, help = "Rewrite records that were already imported")]
    force: bool,
    #[command(flatten)]
    report: ReportArgs,
}

#[derive(Debug, Args)]
struct ConvertShortcodesArgs {
    #[arg(long = "shortcode", value_name = "NAME", help = "Limit to these shortcodes")]
    shortcodes: Vec<String>,
    #[command(flatten)]
    batch: BatchArgs,
    #[command(flatten)]
    report: ReportArgs,
}

#[derive(Debug, Args)]
struct SplitBylinesArgs {
    #[arg(long, default_value = DEFAULT_BYLINE_META_KEY)]
    meta_key: String,
    #[command(flatten)]
    batch: BatchArgs,
    #[command(flatten)]
    report: ReportArgs,
}

#[derive(Debug, Args)]
struct RedirectsImportArgs {
    #[command(flatten)]
    source: SourceArgs,
    #[command(flatten)]
    report: ReportArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Stats => run_db_stats(&runtime),
            DbSubcommand::Migrate => run_db_migrate(&runtime),
        },
        Some(Commands::Import(ImportArgs { command })) => match command {
            ImportSubcommand::Posts(args) => run_import_posts(&runtime, args),
        },
        Some(Commands::Content(ContentArgs { command })) => match command {
            ContentSubcommand::ConvertShortcodes(args) => run_convert_shortcodes(&runtime, args),
            ContentSubcommand::ConvertComponents(args) => run_convert_components(&runtime, args),
        },
        Some(Commands::Authors(AuthorsArgs { command })) => match command {
            AuthorsSubcommand::SplitBylines(args) => run_split_bylines(&runtime, args),
        },
        Some(Commands::Redirects(RedirectsArgs { command })) => match command {
            RedirectsSubcommand::Import(args) => run_redirects_import(&runtime, args),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "presstool=debug" } else { "presstool=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let migrations = run_migrations(&paths)?;

    println!("Initialized presstool runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("logs_dir: {}", normalize_path(&paths.logs_dir));
    println!("uploads_dir: {}", normalize_path(&paths.uploads_dir));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(report.wrote_config));
    println!("migrations.applied: {}", migrations.applied.len());
    println!("schema_version: {}", migrations.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    if report.applied.is_empty() {
        println!("migrations.applied: <none>");
    } else {
        for migration in &report.applied {
            println!("migrations.applied: v{:03}_{}", migration.version, migration.name);
        }
    }
    println!("schema_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if status.db_exists {
        let site = SqliteSite::open(&paths)?;
        let stats = site.stats()?;
        println!("schema_version: {}/{}", current_version(site.connection())?, latest_version());
        println!("posts: {}", stats.posts);
        println!("attachments: {}", stats.attachments);
        println!("terms: {}", stats.terms);
        println!("users: {}", stats.users);
        println!("guest_authors: {}", stats.guest_authors);
        println!("redirects: {}", stats.redirects);
    } else {
        println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    }
    for warning in &status.warnings {
        println!("warning: {warning}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_import_posts(runtime: &RuntimeOptions, args: ImportPostsArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let records = session.read_source(&args.source)?;
    let mapper = ColumnMapper::from_config(
        &session.config.mapping,
        session.config.timezone_offset()?,
        &args.post_type,
        &args.status,
    )?;
    let summary = session.run("import-posts", &args.report, |migration| {
        migration.import_posts(
            &mapper,
            &records,
            &ImportOptions {
                limit: args.limit,
                force: args.force,
            },
        )
    })?;
    print_summary("import posts", &summary, runtime, &session.paths);
    println!("records.read: {}", records.len());
    Ok(())
}

fn run_convert_components(runtime: &RuntimeOptions, args: ImportPostsArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let records = session.read_source(&args.source)?;
    let mapper = ColumnMapper::from_config(
        &session.config.mapping,
        session.config.timezone_offset()?,
        &args.post_type,
        &args.status,
    )?
    .with_required(vec![Field::Title]);
    let summary = session.run("convert-components", &args.report, |migration| {
        migration.convert_components(
            &mapper,
            &records,
            &ImportOptions {
                limit: args.limit,
                force: args.force,
            },
        )
    })?;
    print_summary("content convert-components", &summary, runtime, &session.paths);
    println!("records.read: {}", records.len());
    Ok(())
}

fn run_convert_shortcodes(runtime: &RuntimeOptions, args: ConvertShortcodesArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let options = ShortcodeOptions {
        batch: session.batch_options(&args.batch),
        shortcodes: args.shortcodes,
    };
    let marker = shortcode_marker(&options.shortcodes);
    let summary = session.run("convert-shortcodes", &args.report, |migration| {
        migration.convert_shortcodes(&options)
    })?;
    print_summary("content convert-shortcodes", &summary, runtime, &session.paths);
    println!("marker: {marker}");
    Ok(())
}

fn run_split_bylines(runtime: &RuntimeOptions, args: SplitBylinesArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let options = BylineOptions {
        batch: session.batch_options(&args.batch),
        meta_key: args.meta_key,
        ..BylineOptions::default()
    }
    .with_author_aliases(&session.config.mapping.author_aliases);
    let summary = session.run("split-bylines", &args.report, |migration| {
        migration.split_bylines(&options)
    })?;
    print_summary("authors split-bylines", &summary, runtime, &session.paths);
    println!("meta_key: {}", options.meta_key);
    Ok(())
}

fn run_redirects_import(runtime: &RuntimeOptions, args: RedirectsImportArgs) -> Result<()> {
    let mut session = Session::open(runtime)?;
    let records = session.read_source(&args.source)?;
    let summary = session.run("import-redirects", &args.report, |migration| {
        migration.import_redirects(&records)
    })?;
    print_summary("redirects import", &summary, runtime, &session.paths);
    println!("records.read: {}", records.len());
    Ok(())
}

/// Resolved layout, loaded config, and an open site database with a current schema.
struct Session {
    paths: ResolvedPaths,
    config: PressConfig,
    site: SqliteSite,
}

impl Session {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let status = inspect_runtime(&paths)?;
        ensure_runtime_ready(&paths, &status)?;
        let config = load_config(&paths.config_path)?;
        let site = SqliteSite::open(&paths)?;
        debug!(
            db_path = %normalize_path(&paths.db_path),
            config_path = %normalize_path(&paths.config_path),
            "session opened"
        );
        Ok(Self {
            paths,
            config,
            site,
        })
    }

    fn read_source(&self, args: &SourceArgs) -> Result<Vec<LegacyRecord>> {
        let format = args.format.as_deref().map(SourceFormat::parse).transpose()?;
        let options = SourceOptions {
            format,
            item_element: args.item_element.clone(),
            ..SourceOptions::default()
        }
        .with_id_column(args.id_column.as_deref(), &self.config.mapping);
        read_records(&args.path, &options)
            .with_context(|| format!("failed to read source {}", normalize_path(&args.path)))
    }

    fn batch_options(&self, args: &BatchArgs) -> BatchOptions {
        BatchOptions {
            post_types: args.post_types.clone(),
            batch_size: args.batch.unwrap_or_else(|| self.config.batch_size()),
            post_id: args.post_id,
            min_post_id: args.min_post_id,
            limit: args.limit,
        }
    }

    fn run<C>(&mut self, command: &str, report: &ReportArgs, body: C) -> Result<ReportSummary>
    where
        C: FnOnce(&mut Migration<'_, SqliteSite, HttpMediaFetcher>) -> Result<()>,
    {
        let mut fetcher = HttpMediaFetcher::new(HttpMediaFetcherConfig::from_config(&self.config))?;
        let settings = MediaSettings::from_config(&self.config, &self.paths);
        let registry = ConverterRegistry::with_builtins();
        let reporter = Reporter::open(ReportOptions {
            command: command.to_string(),
            log_dir: Some(self.config.log_dir(&self.paths)),
            csv: self.config.csv_reports() && !report.no_csv,
            csv_path: report.csv_report.clone(),
            dry_run: report.dry_run,
        });
        let mut migration =
            Migration::new(&mut self.site, &mut fetcher, &settings, &registry, reporter);
        let outcome = body(&mut migration);
        let summary = migration.finish();
        outcome?;
        Ok(summary)
    }
}

fn print_summary(title: &str, summary: &ReportSummary, runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    println!("{title}");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("dry_run: {}", format_flag(summary.dry_run));
    println!("records.marked: {}", summary.tally.marked);
    println!("records.written: {}", summary.tally.written);
    println!("records.skipped: {}", summary.tally.skipped);
    println!("records.failed: {}", summary.tally.failed);
    println!("anomalies: {}", summary.anomalies);
    println!(
        "log_path: {}",
        summary
            .log_path
            .as_deref()
            .map(normalize_path)
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!(
        "csv_path: {}",
        summary
            .csv_path
            .as_deref()
            .map(normalize_path)
            .unwrap_or_else(|| "<none>".to_string())
    );
    if summary.write_failures > 0 {
        println!("report.write_failures: {}", summary.write_failures);
    }
    print_diagnostics(runtime, paths);
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
