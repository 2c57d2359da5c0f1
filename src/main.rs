use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, fs};

use anyhow::{anyhow, Result};
use env_logger::Builder;
use futures::StreamExt;
use log::{self, LevelFilter, debug, error, info, warn};

use seqtoid_orchestrator::cli::{parse, Arguments};
use seqtoid_orchestrator::config::defs::{
    PipelineError, RunConfig, ToolPaths, AWK_TAG, DEFAULT_ALIGN_THREADS, DEFAULT_THREADS,
};
use seqtoid_orchestrator::pipelines::consensus_genome::generate_plan;
use seqtoid_orchestrator::pipelines::executor::is_final_record;
use seqtoid_orchestrator::pipelines::run::RunController;
use seqtoid_orchestrator::utils::bed;
use seqtoid_orchestrator::utils::command::check_version;
use seqtoid_orchestrator::utils::file::{absolutize, write_executable};
use seqtoid_orchestrator::utils::pairing::{resolve_uploads, PairingConvention, UploadedFile};
use seqtoid_orchestrator::utils::system::{detect_cores_and_load, oversubscription_warning};


/// Exit code reported for a run stopped by interrupt.
const CANCELLED_EXIT_CODE: i32 = 130;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    let dir = env::current_dir()?;
    let module = args.module.clone();
    if module != "mask_regions" {
        println!("\n-------------\n SeqToID orchestrator\n-------------\n");
        info!("The current directory is {:?}\n", dir);
    }

    let result = match module.as_str() {
        "run" => run_module(&args, &dir).await,
        "plan" => plan_module(&args, &dir).await,
        "mask_regions" => mask_regions_module(&args, &dir),
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module)).into()),
    };

    match result {
        Ok(0) => {
            debug!("{} complete: {} milliseconds.", module, run_start.elapsed().as_millis());
            Ok(())
        }
        Ok(code) => {
            error!("{} finished with exit code {} at {} milliseconds.", module, code, run_start.elapsed().as_millis());
            std::process::exit(code);
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }
}


/// Triggers one run, prints its progress as it is written, and returns the
/// pipeline's exit code.
async fn run_module(args: &Arguments, cwd: &Path) -> Result<i32> {
    let uploads = collect_uploads(args, cwd)?;
    let config = build_config(args, cwd, &uploads).await?;

    if args.skip_preflight {
        debug!("Skipping tool preflight");
    } else {
        preflight(&config.tools).await;
    }

    let controller = RunController::new(Arc::new(config));
    let ack = controller.trigger(uploads).await?;
    info!("Run {} accepted for sample(s) {:?}", ack.run_id, ack.samples);
    info!("Plan: {}", ack.plan_path.display());
    info!("Progress log: {}", ack.log_path.display());

    let interrupt = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            interrupt.cancel().await;
        }
    });

    let mut events = controller.subscribe();
    while let Some(event) = events.next().await {
        let mut finished = false;
        for line in event.lines() {
            println!("{}", line);
            finished |= is_final_record(line);
        }
        if finished {
            break;
        }
    }
    drop(events);

    match controller.wait().await.into_result() {
        Ok(()) => Ok(0),
        Err(PipelineError::StepFailed { label, exit_code }) => {
            error!("{} failed with exit code {}", label, exit_code);
            Ok(exit_code)
        }
        Err(PipelineError::Cancelled) => Ok(CANCELLED_EXIT_CODE),
        Err(e) => Err(e.into()),
    }
}


/// Resolves the uploads and writes the script and plan JSON without running.
async fn plan_module(args: &Arguments, cwd: &Path) -> Result<i32> {
    let uploads = collect_uploads(args, cwd)?;
    let config = build_config(args, cwd, &uploads).await?;

    let resolution = resolve_uploads(&uploads)?;
    let plan = generate_plan(&config, &resolution.genome, &resolution.samples);

    write_executable(&config.script_path(), &plan.render_script())?;
    fs::write(config.plan_json_path(), plan.to_json()?)?;

    println!("{}", config.script_path().display());
    println!("{}", config.plan_json_path().display());
    info!("Planned {} steps for sample(s) {:?}", plan.len(), resolution.sample_names());
    Ok(0)
}


/// Helper invoked by the plan: low-coverage positions in, BED intervals out.
fn mask_regions_module(args: &Arguments, cwd: &Path) -> Result<i32> {
    let input = args
        .input
        .as_ref()
        .ok_or_else(|| anyhow!("mask_regions requires -i <coverage file>"))?;
    let output = args
        .out_dir
        .as_ref()
        .ok_or_else(|| anyhow!("mask_regions requires -o <bed file>"))?;
    let sample = args.sample.as_deref().unwrap_or("sample");

    bed::mask_regions(
        sample,
        &absolutize(Path::new(input), cwd),
        &absolutize(Path::new(output), cwd),
    )?;
    Ok(0)
}


fn collect_uploads(args: &Arguments, cwd: &Path) -> Result<Vec<UploadedFile>, PipelineError> {
    if args.files.is_empty() {
        return Err(PipelineError::InvalidConfig("No input files given (-f)".to_string()));
    }
    let mut uploads = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let path = absolutize(Path::new(file), cwd);
        if !path.exists() {
            return Err(PipelineError::InvalidConfig(format!("Cannot find input file {}", path.display())));
        }
        uploads.push(UploadedFile::from_path(path));
    }
    Ok(uploads)
}


async fn build_config(args: &Arguments, cwd: &Path, uploads: &[UploadedFile]) -> Result<RunConfig> {
    let out_dir = setup_output_dir(args, cwd, uploads)?;

    let threads = args.threads.unwrap_or(DEFAULT_THREADS).max(1);
    let align_threads = args.align_threads.unwrap_or(DEFAULT_ALIGN_THREADS).max(1);
    let (cores, cpu_load) = detect_cores_and_load().await?;
    debug!("Detected {} physical cores; CPU load {}%; using {} tool threads, {} alignment threads",
        cores, cpu_load, threads, align_threads);
    if let Some(message) = oversubscription_warning(threads, align_threads, cores) {
        warn!("{}", message);
    }

    let mut config = RunConfig::with_defaults(cwd.to_path_buf(), out_dir);
    config.tools = tool_paths(args)?;
    config.threads = threads;
    config.align_threads = align_threads;
    config.min_depth = args.min_depth;
    config.poll_interval = Duration::from_millis(args.poll_ms.max(1));
    Ok(config)
}


fn tool_paths(args: &Arguments) -> Result<ToolPaths> {
    let mut tools = ToolPaths::default();
    let overrides: [(&mut String, &Option<String>); 10] = [
        (&mut tools.shell, &args.bash),
        (&mut tools.fastqc, &args.fastqc),
        (&mut tools.fastp, &args.fastp),
        (&mut tools.bowtie2, &args.bowtie2),
        (&mut tools.bowtie2_build, &args.bowtie2_build),
        (&mut tools.samtools, &args.samtools),
        (&mut tools.bcftools, &args.bcftools),
        (&mut tools.bedtools, &args.bedtools),
        (&mut tools.awk, &args.awk),
        (&mut tools.multiqc, &args.multiqc),
    ];
    for (slot, value) in overrides {
        if let Some(program) = value {
            *slot = program.clone();
        }
    }
    tools.mask_regions = match &args.mask_regions {
        Some(program) => program.clone(),
        None => env::current_exe()?.to_string_lossy().into_owned(),
    };
    Ok(tools)
}


/// Warns for every tool that does not answer its version flag. A missing
/// tool only fails the run at the step that needs it.
async fn preflight(tools: &ToolPaths) {
    for (tag, program) in tools.external() {
        if tag == AWK_TAG {
            continue;
        }
        match check_version(tag, program).await {
            Ok(version) => debug!("{}: {}", tag, version),
            Err(e) => warn!("Tool check failed for {} ({}): {}", tag, program, e),
        }
    }
}


/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `<sample_base>_YYYYMMDD`, the base
/// taken from the first read file.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// * `uploads` - Input files in upload order.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path, uploads: &[UploadedFile]) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => absolutize(Path::new(out), cwd),
        None => {
            let first_reads = uploads
                .iter()
                .find(|f| !f.is_genome())
                .ok_or_else(|| anyhow!("No read files given"))?;
            let dir_base = match PairingConvention::read1_base(&first_reads.original_name) {
                Some(base) => base.to_string(),
                None => {
                    info!("No read 1 tag found. Using bare file stem as sample_base.");
                    first_reads
                        .stored_path
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "default_sample".to_string())
                }
            };
            let timestamp = chrono::Local::now().format("%Y%m%d").to_string();
            cwd.join(format!("{}_{}", dir_base, timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
