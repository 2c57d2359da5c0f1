use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use lazy_static::lazy_static;
use thiserror::Error;

// External software
pub const BASH_TAG: &str = "bash";
pub const FASTQC_TAG: &str = "fastqc";
pub const FASTP_TAG: &str = "fastp";
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const BOWTIE2_BUILD_TAG: &str = "bowtie2-build";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BCFTOOLS_TAG: &str = "bcftools";
pub const BEDTOOLS_TAG: &str = "bedtools";
pub const AWK_TAG: &str = "awk";
pub const MULTIQC_TAG: &str = "multiqc";
pub const SELF_TAG: &str = "seqtoid-orchestrator";


lazy_static! {
    /// Flag each external tool answers with its version on the first output line.
    pub static ref TOOL_VERSION_FLAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(BASH_TAG, "--version");
        m.insert(FASTQC_TAG, "--version");
        m.insert(FASTP_TAG, "-v");
        m.insert(BOWTIE2_TAG, "--version");
        m.insert(BOWTIE2_BUILD_TAG, "--version");
        m.insert(SAMTOOLS_TAG, "--version");
        m.insert(BCFTOOLS_TAG, "--version");
        m.insert(BEDTOOLS_TAG, "--version");
        m.insert(MULTIQC_TAG, "--version");
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    View,
    Flagstat,
    Sort,
    Rmdup,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcftoolsSubcommand {
    Mpileup,
    Call,
    Index,
    Consensus,
}

// Static Filenames
pub const PIPELINE_SCRIPT: &str = "pipeline.sh";
pub const PLAN_JSON: &str = "plan.json";
pub const PROGRESS_LOG: &str = "progress.txt";
pub const FASTQC_DIR: &str = "fastqc_output";
pub const MULTIQC_DIR: &str = "multiqc_output";

// Static Parameters
pub const DEFAULT_THREADS: usize = 4;
pub const DEFAULT_ALIGN_THREADS: usize = 4;
pub const DEFAULT_MIN_DEPTH: u32 = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const MASK_CHAR: &str = "N";
pub const CONSENSUS_PLOIDY: u8 = 1;

pub const GENOME_EXTS: &[&'static str] = &["fasta", "fa"];
pub const READS_EXT: &str = "fastq.gz";


/// Program used for every external tool the plan invokes.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPaths {
    pub shell: String,
    pub fastqc: String,
    pub fastp: String,
    pub bowtie2: String,
    pub bowtie2_build: String,
    pub samtools: String,
    pub bcftools: String,
    pub bedtools: String,
    pub awk: String,
    pub multiqc: String,
    pub mask_regions: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            shell: BASH_TAG.to_string(),
            fastqc: FASTQC_TAG.to_string(),
            fastp: FASTP_TAG.to_string(),
            bowtie2: BOWTIE2_TAG.to_string(),
            bowtie2_build: BOWTIE2_BUILD_TAG.to_string(),
            samtools: SAMTOOLS_TAG.to_string(),
            bcftools: BCFTOOLS_TAG.to_string(),
            bedtools: BEDTOOLS_TAG.to_string(),
            awk: AWK_TAG.to_string(),
            multiqc: MULTIQC_TAG.to_string(),
            mask_regions: SELF_TAG.to_string(),
        }
    }
}

impl ToolPaths {
    /// Points every pipeline tool (not the shell) at one program.
    pub fn all(program: &str) -> Self {
        Self {
            shell: BASH_TAG.to_string(),
            fastqc: program.to_string(),
            fastp: program.to_string(),
            bowtie2: program.to_string(),
            bowtie2_build: program.to_string(),
            samtools: program.to_string(),
            bcftools: program.to_string(),
            bedtools: program.to_string(),
            awk: program.to_string(),
            multiqc: program.to_string(),
            mask_regions: program.to_string(),
        }
    }

    /// (tag, program) pairs for the preflight check.
    pub fn external(&self) -> Vec<(&'static str, &str)> {
        vec![
            (BASH_TAG, self.shell.as_str()),
            (FASTQC_TAG, self.fastqc.as_str()),
            (FASTP_TAG, self.fastp.as_str()),
            (BOWTIE2_TAG, self.bowtie2.as_str()),
            (BOWTIE2_BUILD_TAG, self.bowtie2_build.as_str()),
            (SAMTOOLS_TAG, self.samtools.as_str()),
            (BCFTOOLS_TAG, self.bcftools.as_str()),
            (BEDTOOLS_TAG, self.bedtools.as_str()),
            (MULTIQC_TAG, self.multiqc.as_str()),
        ]
    }
}


pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub tools: ToolPaths,
    pub threads: usize,
    pub align_threads: usize,
    pub min_depth: u32,
    pub poll_interval: Duration,
}

impl RunConfig {
    pub fn with_defaults(cwd: PathBuf, out_dir: PathBuf) -> Self {
        Self {
            cwd,
            out_dir,
            tools: ToolPaths::default(),
            threads: DEFAULT_THREADS,
            align_threads: DEFAULT_ALIGN_THREADS,
            min_depth: DEFAULT_MIN_DEPTH,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }

    pub fn progress_log_path(&self) -> PathBuf {
        self.out_dir.join(PROGRESS_LOG)
    }

    pub fn script_path(&self) -> PathBuf {
        self.out_dir.join(PIPELINE_SCRIPT)
    }

    pub fn plan_json_path(&self) -> PathBuf {
        self.out_dir.join(PLAN_JSON)
    }
}


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No reference genome found: upload a .fasta or .fa file")]
    NoGenomeFound,
    #[error("File pair does not match: '{first}' and '{second}'")]
    MismatchedPair { first: String, second: String },
    #[error("Sample '{0}' appears more than once in the upload")]
    DuplicateSample(String),
    #[error("Invalid sample name '{0}': use letters, digits, '_', '-' or '.'")]
    InvalidSampleName(String),
    #[error("A pipeline run is already in progress")]
    RunAlreadyInProgress,
    #[error("Pipeline failed to start: {0}")]
    RunFailedToStart(String),
    #[error("Step failed: {label} (exit code {exit_code})")]
    StepFailed { label: String, exit_code: i32 },
    #[error("Pipeline run was cancelled")]
    Cancelled,
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    IOError(String),
    #[error("{tool} failed: {error}")]
    ToolExecution { tool: String, error: String },
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}
