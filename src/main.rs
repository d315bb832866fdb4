use clap::Parser as ClapParser;
use rand::RngCore;
use std::io::Read;

use opal::planner::Planner;
use opal::registry::DEFAULT_REGISTRY;
use opal::vault::Vault;

#[derive(ClapParser)]
#[command(name = "opal")]
#[command(about = "Toolchain for the opal command-definition language")]
#[command(version)]
struct Cli {
    /// Parse the script from a command line argument
    #[arg(short = 'c')]
    script: Option<String>,

    /// Dump the token stream instead of parsing
    #[arg(long = "tokens")]
    tokens: bool,

    /// Dump the parsed program
    #[arg(long = "ast")]
    ast: bool,

    /// Build a plan for the named command
    #[arg(long = "plan")]
    plan: Option<String>,

    /// Output as JSON
    #[arg(long = "json")]
    json: bool,

    /// Source file to read
    #[arg()]
    source_file: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("OPAL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let source = if let Some(s) = cli.script {
        s
    } else if let Some(ref file) = cli.source_file {
        match std::fs::read_to_string(file) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("Error: cannot read source file: {}: {}", file, e);
                std::process::exit(1);
            }
        }
    } else {
        use std::io::IsTerminal;
        if std::io::stdin().is_terminal() {
            eprintln!("Error: no source provided. Use -c 'source', a file argument, or pipe via stdin.");
            std::process::exit(1);
        }
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).unwrap_or_default();
        buf
    };

    if cli.tokens {
        let tokens = opal::parser::Lexer::new(&source, &DEFAULT_REGISTRY).tokenize();
        for token in &tokens {
            println!(
                "{}:{} {} {:?}",
                token.line,
                token.column,
                token.token_type.as_str(),
                token.value
            );
        }
        return;
    }

    let program = match opal::parser::parse(&source) {
        Ok(program) => program,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    if cli.ast {
        println!("{:#?}", program);
        return;
    }

    if let Some(command) = cli.plan {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let mut vault = Vault::with_plan_key(&key);
        let planner = Planner::new(&program, &DEFAULT_REGISTRY);
        match planner.plan(&command, &mut vault) {
            Ok(plan) => {
                if cli.json {
                    match serde_json::to_string_pretty(&plan) {
                        Ok(json) => println!("{}", json),
                        Err(e) => {
                            eprintln!("Error: {}", e);
                            std::process::exit(1);
                        }
                    }
                } else {
                    println!("command: {}", plan.command);
                    for use_ in &plan.secret_uses {
                        println!("  {} {} {}", use_.display_id, use_.site_id, use_.site);
                    }
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    // Default: report what parsed
    println!(
        "parsed {} variable(s), {} command(s)",
        program.vars.len(),
        program.commands.len()
    );
    for command in &program.commands {
        println!("  {} {}", command.kind.as_str(), command.name);
    }
}
