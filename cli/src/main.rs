use clap::Parser;
use colored::*;
use log::debug;
use std::io::Write;
use std::process;
use std::sync::Arc;

use solvepool_core::modules::proxy_source::{self, DEFAULT_RETRY_INTERVAL};
use solvepool_core::{
    CommandExecutor, ConsoleSink, NullSink, PoolState, ProxyPool, ProxySource, RequestScheduler,
    SinkRef, SolveReport, SolveRequest, SolverConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "solvepool",
    version,
    about = "Proxy-rotating challenge solver",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Solve once:                     solvepool --pageurl https://site.test/login --sitekey KEY -s proxies.txt
  Inline proxies:                 solvepool --pageurl https://site.test --sitekey KEY -P 10.0.0.1:8080 -P 10.0.0.2:8080
  Remote list, 20 solves:         solvepool --pageurl https://site.test --sitekey KEY -s https://lists.test/p.txt -n 20
  Custom solver:                  solvepool --pageurl https://site.test --sitekey KEY -s proxies.txt --solver ./solve.sh
  JSON lines output:              solvepool --pageurl https://site.test --sitekey KEY -s proxies.txt --json
  Dry-run test:                   solvepool --pageurl https://site.test --sitekey KEY -s proxies.txt --dry-run"
)]
pub struct Args {
    #[arg(long, help = "URL of the page hosting the challenge")]
    pub pageurl: String,

    #[arg(long, help = "Site key of the challenge widget")]
    pub sitekey: String,

    #[arg(short = 's', long, conflicts_with = "proxy", help = "Proxy list: a file or an http(s) URL, one proxy per line")]
    pub proxy_source: Option<String>,

    #[arg(short = 'P', long = "proxy", help = "Inline proxy (host:port), repeatable")]
    pub proxy: Vec<String>,

    #[arg(long, help = "Solver program run once per attempt")]
    pub solver: Option<String>,

    #[arg(long = "solver-arg", allow_hyphen_values = true, help = "Extra argument passed to the solver first, repeatable")]
    pub solver_args: Vec<String>,

    #[arg(short = 'c', long, value_parser = parse_positive, help = "Maximum solves running at once")]
    pub concurrency: Option<usize>,

    #[arg(short = 'n', long, default_value_t = 1, value_parser = parse_positive, help = "Number of solves to run")]
    pub count: usize,

    #[arg(long, help = "Overall deadline per solve in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Deadline for a single attempt in seconds")]
    pub attempt_timeout: Option<u64>,

    #[arg(long, help = "Seconds a detected proxy stays out of rotation")]
    pub ban_cooldown: Option<u64>,

    #[arg(long, help = "Give up after this many attempts")]
    pub max_attempts: Option<u32>,

    #[arg(long, help = "Username for authenticated proxies")]
    pub proxy_user: Option<String>,

    #[arg(long, help = "Password for authenticated proxies")]
    pub proxy_pass: Option<String>,

    #[arg(long, help = "JSON config file; flags override its values")]
    pub config: Option<String>,

    #[arg(long, help = "Pool state file kept across runs")]
    pub state: Option<String>,

    #[arg(long, help = "Print one JSON object per solve instead of colored output")]
    pub json: bool,

    #[arg(short = 'v', long, default_value_t = false, help = "Show every attempt and debug logs")]
    pub verbose: bool,

    #[arg(long, help = "Show what would run without solving anything")]
    pub dry_run: bool,
}

fn parse_positive(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[tokio::main]
async fn main() {
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();

    if !args.json {
        print_banner();
    }

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => fail(&format!("[!] Invalid configuration: {}", e)),
    };
    debug!(
        "solver '{}' ({} extra arg(s)), concurrency {}, timeout {}s, attempt timeout {}s, max attempts {:?}",
        config.solver_command,
        config.solver_args.len(),
        config.concurrency,
        config.solve_timeout,
        config.attempt_timeout,
        config.max_attempts
    );

    let request = match SolveRequest::new(&args.pageurl, &args.sitekey, config.solve_timeout()) {
        Ok(request) => request,
        Err(e) => fail(&format!("[!] {}", e)),
    };

    let source = match config.source_ref().map(ProxySource::parse).transpose() {
        Ok(source) => source,
        Err(e) => fail(&format!("[!] {}", e)),
    };

    if args.dry_run {
        dry_run(&request, &config, source.as_ref(), &args).await;
        return;
    }

    if !args.json {
        print_solve_config(&request, &config, source.as_ref(), &args);
    }

    let sink: SinkRef = if args.json { NullSink::new_ref() } else { ConsoleSink::new_ref(config.verbose) };

    let pool = Arc::new(ProxyPool::new(config.ban_cooldown()));
    let state_path = args.state.clone();
    if let Some(ref path) = state_path {
        if let Some(state) = PoolState::load(path) {
            let restored = state.restore_into(&pool);
            sink.on_log("info", &format!("[*] Restored {} proxy record(s) from {}", restored, path));
        }
    }

    let _reload = match source {
        Some(source) => {
            let client = match proxy_source::build_client() {
                Ok(client) => client,
                Err(e) => fail(&format!("[!] {}", e)),
            };
            match proxy_source::reload_once(&pool, &source, &client).await {
                Ok(report) => sink.on_log(
                    "success",
                    &format!("[+] Loaded {} proxies from {}", report.listed, source),
                ),
                Err(e) => fail(&format!("[!] Failed to load proxies from {}: {}", source, e)),
            }
            Some(proxy_source::spawn_reload(
                Arc::clone(&pool),
                source,
                client,
                config.reload_interval(),
                DEFAULT_RETRY_INTERVAL,
                Arc::clone(&sink),
            ))
        }
        None => {
            // Without -P the restored state is the whole pool.
            if !args.proxy.is_empty() {
                pool.add(&args.proxy);
            }
            None
        }
    };

    if pool.stats().eligible == 0 {
        sink.on_log("warn", "[!] No eligible proxies yet; requests will wait for one.");
    }

    let executor = match CommandExecutor::new(&config.solver_command) {
        Ok(executor) => executor
            .with_args(config.solver_args.clone())
            .with_proxy_auth(config.proxy_auth()),
        Err(e) => fail(&format!("[!] {}", e)),
    };

    let scheduler = RequestScheduler::from_config(Arc::clone(&pool), Arc::new(executor), &config, Arc::clone(&sink));

    sink.on_log("phase", &format!("\r\n[*] Solving {} request(s)...", args.count));
    let requests = vec![request; args.count];
    let reports = scheduler.solve_all(requests).await;

    if args.json {
        for report in &reports {
            println!("{}", report_json(report));
        }
    } else {
        print_summary(&reports, &pool);
    }

    if let Some(ref path) = state_path {
        if let Err(e) = PoolState::capture(&pool).save(path) {
            eprint!("{}\r\n", format!("[!] Failed to save pool state to {}: {}", path, e).red());
        }
    }

    let all_solved = reports.iter().all(|r| r.outcome.is_solved());
    process::exit(if all_solved { 0 } else { 1 });
}

/// Config file (or defaults) with every explicitly passed flag applied on top.
fn build_config(args: &Args) -> anyhow::Result<SolverConfig> {
    let mut config = match args.config {
        Some(ref path) => SolverConfig::from_file(path)?,
        None => SolverConfig::default(),
    };

    if let Some(ref source) = args.proxy_source {
        config.proxy_source = source.clone();
    } else if !args.proxy.is_empty() {
        config.proxy_source.clear();
    }
    if let Some(ref solver) = args.solver {
        config.solver_command = solver.clone();
    }
    if !args.solver_args.is_empty() {
        config.solver_args = args.solver_args.clone();
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(timeout) = args.timeout {
        config.solve_timeout = timeout;
    }
    if let Some(attempt_timeout) = args.attempt_timeout {
        config.attempt_timeout = attempt_timeout;
    }
    if let Some(ban_cooldown) = args.ban_cooldown {
        config.ban_cooldown = ban_cooldown;
    }
    if args.max_attempts.is_some() {
        config.max_attempts = args.max_attempts;
    }
    if args.proxy_user.is_some() {
        config.proxy_username = args.proxy_user.clone();
    }
    if args.proxy_pass.is_some() {
        config.proxy_password = args.proxy_pass.clone();
    }
    config.verbose |= args.verbose;

    if config.concurrency == 0 {
        anyhow::bail!("concurrency must be at least 1");
    }
    Ok(config)
}

async fn dry_run(request: &SolveRequest, config: &SolverConfig, source: Option<&ProxySource>, args: &Args) {
    let proxies = match source {
        Some(file @ ProxySource::File(_)) => {
            let client = match proxy_source::build_client() {
                Ok(client) => client,
                Err(e) => fail(&format!("[!] {}", e)),
            };
            match file.load(&client).await {
                Ok(list) => format!("{} proxies", list.len()),
                Err(e) => fail(&format!("[!] Failed to load proxies from {}: {}", file, e)),
            }
        }
        Some(ProxySource::Url(url)) => format!("proxies from {}", url),
        None => format!("{} proxies", args.proxy.len()),
    };

    println!(
        "[DRY RUN] Would solve {} (sitekey {}) x{} using {} via '{}' (concurrency {}, timeout {}s)",
        request.page_url,
        request.site_key,
        args.count,
        proxies,
        config.solver_command,
        config.concurrency,
        config.solve_timeout
    );
}

fn report_json(report: &SolveReport) -> serde_json::Value {
    let mut value = serde_json::to_value(&report.outcome).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.insert("request".to_string(), report.request_id.into());
        obj.insert("attempts".to_string(), report.attempts.into());
        obj.insert("elapsed_ms".to_string(), (report.elapsed.as_millis() as u64).into());
    }
    value
}

fn fail(message: &str) -> ! {
    eprint!("{}\r\n", message.red());
    process::exit(1);
}

fn print_banner() {
    let banner = r#"
   ___  ___  _ __   _____ _ __   ___   ___  | |
  / __|/ _ \| |\ \ / / _ \ '_ \ / _ \ / _ \ | |
  \__ \ (_) | | \ V /  __/ |_) | (_) | (_) || |
  |___/\___/|_|  \_/ \___| .__/ \___/ \___/ |_|
                         |_|
    "#;
    print!("{}\r\n", banner.bright_cyan().bold());
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn print_solve_config(request: &SolveRequest, config: &SolverConfig, source: Option<&ProxySource>, args: &Args) {
    let verbose_label = if config.verbose { "ON" } else { "OFF" };

    print!("{}\r\n", format!("[+] Page:         {}", request.page_url).green().bold());
    print!("{}\r\n", format!("[+] Site key:     {}", request.site_key).green());
    print!("{}\r\n", format!("[+] Solves:       {}", args.count).blue());
    print!("{}\r\n", format!("[+] Concurrency:  {}", config.concurrency).blue());
    print!("{}\r\n", format!("[+] Timeout:      {}s", config.solve_timeout).blue());
    print!("{}\r\n", format!("[+] Attempt:      {}s", config.attempt_timeout).blue());
    print!("{}\r\n", format!("[+] Ban cooldown: {}s", config.ban_cooldown).blue());
    if let Some(max) = config.max_attempts {
        print!("{}\r\n", format!("[+] Max attempts: {}", max).blue());
    }
    print!("{}\r\n", format!("[+] Solver:       {}", config.solver_command).magenta().bold());
    print!("{}\r\n", format!("[+] Verbose:      {}", verbose_label).magenta());
    match source {
        Some(source) => print!("{}\r\n", format!("[+] Proxies:      {}", source).yellow()),
        None => print!("{}\r\n", format!("[+] Proxies:      {} inline", args.proxy.len()).yellow()),
    }
    if config.proxy_auth().is_some() {
        print!("{}\r\n", "[+] Proxy auth:   enabled".yellow());
    }
    if let Some(ref path) = args.state {
        print!("{}\r\n", format!("[+] State:        {}", path).yellow());
    }
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());
    std::io::stdout().flush().ok();
}

fn print_summary(reports: &[SolveReport], pool: &ProxyPool) {
    let solved = reports.iter().filter(|r| r.outcome.is_solved()).count();
    let attempts: u32 = reports.iter().map(|r| r.attempts).sum();
    let stats = pool.stats();

    print!("\r\n{}\r\n", "━━━ Summary ━━━".bright_white().bold());
    let line = format!("[+] Solved:   {}/{}", solved, reports.len());
    if solved == reports.len() {
        print!("{}\r\n", line.green().bold());
    } else {
        print!("{}\r\n", line.red().bold());
    }
    print!("{}\r\n", format!("[+] Attempts: {}", attempts).blue());
    print!(
        "{}\r\n",
        format!(
            "[+] Pool:     {} total, {} alive, {} banned ({} cooling), {} dead",
            stats.total, stats.alive, stats.banned, stats.cooling, stats.dead
        )
        .blue()
    );
    std::io::stdout().flush().ok();
}
