use clap::Parser;

use crate::config::defs::{DEFAULT_ALIGN_THREADS, DEFAULT_MIN_DEPTH, DEFAULT_POLL_INTERVAL_MS, DEFAULT_THREADS};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "seqtoid-orchestrator", version, about = "Consensus genome pipeline orchestration")]
pub struct Arguments {

    #[arg(short, long, help = "One of: run, plan, mask_regions")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'f', long = "files", num_args = 1.., help = "Uploaded files in upload order: one .fasta/.fa reference plus paired *_1/_2 or *_R1/_R2 .fastq.gz reads")]
    pub files: Vec<String>,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named '<sample_base>_YYYYMMDD' will be created in the current working directory. For mask_regions, the BED file to write.")]
    pub out_dir: Option<String>,

    #[arg(short = 'i', long = "input", help = "mask_regions: low coverage positions file")]
    pub input: Option<String>,

    #[arg(long, help = "mask_regions: sample name used in messages")]
    pub sample: Option<String>,

    #[arg(long, help = format!("Threads for QC and trimming [default: {}]", DEFAULT_THREADS))]
    pub threads: Option<usize>,

    #[arg(long, help = format!("Threads for alignment [default: {}]", DEFAULT_ALIGN_THREADS))]
    pub align_threads: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_MIN_DEPTH, help = "Positions with depth below this are masked")]
    pub min_depth: u32,

    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS, help = "Fallback poll interval for progress subscribers")]
    pub poll_ms: u64,

    #[arg(long, default_value_t = false, help = "Skip the tool version check before a run")]
    pub skip_preflight: bool,

    #[arg(long)]
    pub bash: Option<String>,

    #[arg(long)]
    pub fastqc: Option<String>,

    #[arg(long)]
    pub fastp: Option<String>,

    #[arg(long)]
    pub bowtie2: Option<String>,

    #[arg(long)]
    pub bowtie2_build: Option<String>,

    #[arg(long)]
    pub samtools: Option<String>,

    #[arg(long)]
    pub bcftools: Option<String>,

    #[arg(long)]
    pub bedtools: Option<String>,

    #[arg(long)]
    pub awk: Option<String>,

    #[arg(long)]
    pub multiqc: Option<String>,

    #[arg(long, help = "Program run for the masked-region step; defaults to this binary")]
    pub mask_regions: Option<String>,
}
