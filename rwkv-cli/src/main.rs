use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info};
use rwkv_inference::{Model, RunConfigBuilder, StorageType, run_prompt};
use rwkv_quantize::ModelQuantizer;
use std::path::Path;

/// Define the info subcommand.
fn info_subcommand() -> Command {
    Command::new("info")
        .about("Print the header and tensor table of a model file")
        .arg(Arg::new("MODEL_PATH").help("Model file").required(true).index(1))
}

/// Define the quantize subcommand.
fn quantize_subcommand() -> Command {
    Command::new("quantize")
        .about("Quantize a float32 or float16 model file")
        .arg(Arg::new("SOURCE").help("Source model file").required(true).index(1))
        .arg(Arg::new("DESTINATION").help("Output model file").required(true).index(2))
        .arg(
            Arg::new("type")
                .short('t')
                .long("type")
                .value_name("TYPE")
                .help("Target type: Q4_0, Q4_1, Q5_0, Q5_1 or Q8_0")
                .default_value("Q5_1"),
        )
        .arg(
            Arg::new("no-progress")
                .long("no-progress")
                .help("Do not draw the progress bar")
                .action(ArgAction::SetTrue),
        )
}

/// Define the run subcommand.
fn run_subcommand() -> Command {
    Command::new("run")
        .about("Evaluate a byte-level prompt and show the most likely next tokens")
        .arg(Arg::new("MODEL_PATH").help("Model file").required(true).index(1))
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Prompt; every byte is one token")
                .required(true),
        )
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .value_name("INT")
                .help("Worker threads [default: available parallelism]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("chunk")
                .short('c')
                .long("chunk")
                .value_name("INT")
                .help("Tokens per sequence evaluation")
                .default_value("16")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("gpu-layers")
                .short('g')
                .long("gpu-layers")
                .value_name("INT")
                .help("Layers to offload to the GPU")
                .default_value("0")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("top-k")
                .short('k')
                .long("top-k")
                .value_name("INT")
                .help("Number of next-token candidates to print")
                .default_value("5")
                .value_parser(clap::value_parser!(usize)),
        )
}

fn run_info_command(matches: &ArgMatches) -> Result<()> {
    let model_path = matches.get_one::<String>("MODEL_PATH").unwrap();
    let model = Model::load(model_path)?;
    let header = &model.header;

    info!("Model: {model_path}");
    info!("  version:   {}", header.version);
    info!("  type:      {}", header.data_type);
    info!("  n_vocab:   {}", header.n_vocab);
    info!("  n_embed:   {}", header.n_embed);
    info!("  n_layer:   {}", header.n_layer);
    info!("  ffn width: {}", model.ffn_width());
    info!("");

    for tensor in model.tensors() {
        let shape = match tensor.dim_count() {
            1 => format!("{}", tensor.width()),
            _ => format!("{}x{}", tensor.width(), tensor.height()),
        };
        info!("{:<36} {:<8} {:>12} {:>12}", tensor.name(), tensor.data_type().to_string(), shape, tensor.size_in_bytes());
    }

    info!("");
    info!("Total: {:.2} MiB", model.size_in_bytes() as f64 / (1024.0 * 1024.0));
    Ok(())
}

fn run_quantize_command(matches: &ArgMatches) -> Result<()> {
    let source = matches.get_one::<String>("SOURCE").unwrap();
    let destination = matches.get_one::<String>("DESTINATION").unwrap();
    let target: StorageType = matches.get_one::<String>("type").unwrap().parse()?;

    if !Path::new(source).exists() {
        anyhow::bail!("Source model does not exist: {source}");
    }

    let report = ModelQuantizer::new(target)?
        .with_progress(!matches.get_flag("no-progress"))
        .quantize_file(Path::new(source), Path::new(destination))?;

    info!("Written {destination}: {} bytes of tensor data", report.written_bytes);
    Ok(())
}

fn run_prompt_command(matches: &ArgMatches) -> Result<()> {
    let config = RunConfigBuilder::default()
        .model_path(matches.get_one::<String>("MODEL_PATH"))
        .prompt(matches.get_one::<String>("input"))
        .threads(matches.get_one::<usize>("threads").copied())
        .chunk_size(matches.get_one::<usize>("chunk").copied())
        .gpu_layers(matches.get_one::<usize>("gpu-layers").copied())
        .top_k(matches.get_one::<usize>("top-k").copied())
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    let report = run_prompt(config).map_err(|e| anyhow::anyhow!("Evaluation failed: {e}"))?;

    info!("Loaded in {:.2?}", report.load_time);
    info!(
        "Evaluated {} tokens in {:.2?} ({:.1} tokens/s)",
        report.prompt_tokens,
        report.eval_time,
        report.tokens_per_second()
    );
    for (rank, (token, score)) in report.top_tokens.iter().enumerate() {
        info!("  #{:<2} token {token:>6}  logit {score:>10.4}", rank + 1);
    }
    Ok(())
}

fn execute_commands() -> Result<()> {
    // Bare message format: no timestamp or module prefix
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("rwkv")
        .about("RWKV CLI: inspect, quantize and run RWKV model files")
        .subcommand(info_subcommand())
        .subcommand(quantize_subcommand())
        .subcommand(run_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("info", matches)) => run_info_command(matches),
        Some(("quantize", matches)) => run_quantize_command(matches),
        Some(("run", matches)) => run_prompt_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e}");
        std::process::exit(1);
    }
}
