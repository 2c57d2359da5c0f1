/// Functions and structs for creating external tool command lines

use std::path::Path;

use anyhow::{anyhow, Result};
use tokio::process::Command;

use crate::config::defs::TOOL_VERSION_FLAGS;
use crate::utils::streams::{read_child_output_to_vec, ChildStream};


fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}


pub mod fastqc {
    use std::path::Path;
    use super::path_arg;

    pub fn arg_generator(out_dir: &Path, read1: &Path, read2: &Path) -> Vec<String> {
        vec![
            "-o".to_string(),
            path_arg(out_dir),
            path_arg(read1),
            path_arg(read2),
        ]
    }
}


pub mod fastp {
    use std::path::PathBuf;
    use super::path_arg;

    pub struct FastpConfig {
        pub in1: PathBuf,
        pub in2: PathBuf,
        pub out1: PathBuf,
        pub out2: PathBuf,
        pub html_report: PathBuf,
        pub json_report: PathBuf,
        pub threads: usize,
    }

    pub fn arg_generator(config: &FastpConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-i".to_string());
        args_vec.push(path_arg(&config.in1));
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(&config.out1));
        args_vec.push("-I".to_string());
        args_vec.push(path_arg(&config.in2));
        args_vec.push("-O".to_string());
        args_vec.push(path_arg(&config.out2));
        args_vec.push("--thread".to_string());
        args_vec.push(config.threads.to_string());
        args_vec.push("-h".to_string());
        args_vec.push(path_arg(&config.html_report));
        args_vec.push("-j".to_string());
        args_vec.push(path_arg(&config.json_report));
        args_vec
    }
}


pub mod bowtie2 {
    use std::path::{Path, PathBuf};
    use super::path_arg;

    pub struct Bowtie2Config {
        pub index_base: PathBuf,
        pub threads: usize,
        pub in1: PathBuf,
        pub in2: PathBuf,
        pub sam_out: PathBuf,
    }

    pub fn arg_generator(config: &Bowtie2Config) -> Vec<String> {
        vec![
            "-p".to_string(),
            config.threads.to_string(),
            "-x".to_string(),
            path_arg(&config.index_base),
            "-1".to_string(),
            path_arg(&config.in1),
            "-2".to_string(),
            path_arg(&config.in2),
            "-S".to_string(),
            path_arg(&config.sam_out),
        ]
    }

    pub fn build_arg_generator(fasta: &Path, index_base: &Path) -> Vec<String> {
        vec![path_arg(fasta), path_arg(index_base)]
    }
}


pub mod samtools {
    use crate::config::defs::SamtoolsSubcommand;

    /// Subcommand, its option fields in order, then positional arguments.
    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        pub subcommand_fields: Vec<(String, Option<String>)>,
        pub positional: Vec<String>,
    }

    pub fn arg_generator(config: &SamtoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        let subcommand = match config.subcommand {
            SamtoolsSubcommand::View => "view",
            SamtoolsSubcommand::Flagstat => "flagstat",
            SamtoolsSubcommand::Sort => "sort",
            SamtoolsSubcommand::Rmdup => "rmdup",
            SamtoolsSubcommand::Depth => "depth",
        };
        args_vec.push(subcommand.to_string());
        for (flag, value) in &config.subcommand_fields {
            args_vec.push(flag.clone());
            if let Some(v) = value {
                args_vec.push(v.clone());
            }
        }
        args_vec.extend(config.positional.iter().cloned());
        args_vec
    }
}


pub mod bcftools {
    use crate::config::defs::BcftoolsSubcommand;

    pub struct BcftoolsConfig {
        pub subcommand: BcftoolsSubcommand,
        pub subcommand_fields: Vec<(String, Option<String>)>,
        pub positional: Vec<String>,
    }

    pub fn arg_generator(config: &BcftoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        let subcommand = match config.subcommand {
            BcftoolsSubcommand::Mpileup => "mpileup",
            BcftoolsSubcommand::Call => "call",
            BcftoolsSubcommand::Index => "index",
            BcftoolsSubcommand::Consensus => "consensus",
        };
        args_vec.push(subcommand.to_string());
        for (flag, value) in &config.subcommand_fields {
            args_vec.push(flag.clone());
            if let Some(v) = value {
                args_vec.push(v.clone());
            }
        }
        args_vec.extend(config.positional.iter().cloned());
        args_vec
    }
}


pub mod bedtools {
    use std::path::Path;
    use crate::config::defs::MASK_CHAR;
    use super::path_arg;

    pub fn maskfasta_arg_generator(fasta: &Path, bed: &Path, masked_out: &Path) -> Vec<String> {
        vec![
            "maskfasta".to_string(),
            "-fi".to_string(),
            path_arg(fasta),
            "-bed".to_string(),
            path_arg(bed),
            "-mc".to_string(),
            MASK_CHAR.to_string(),
            "-fo".to_string(),
            path_arg(masked_out),
        ]
    }
}


pub mod awk {
    /// Keeps `samtools depth` rows whose depth column is below `min_depth`.
    pub fn low_coverage_arg_generator(min_depth: u32) -> Vec<String> {
        vec![format!("$3 < {} {{print $1\"\\t\"$2\"\\t\"$3}}", min_depth)]
    }
}


pub mod multiqc {
    use std::path::Path;
    use super::path_arg;

    pub fn arg_generator(inputs: &[&Path], out_dir: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = inputs.iter().map(|p| path_arg(p)).collect();
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(out_dir));
        args_vec
    }
}


pub mod mask_regions {
    use std::path::Path;
    use super::path_arg;

    /// Arguments for this binary's `mask_regions` module.
    pub fn arg_generator(sample: &str, coverage: &Path, bed_out: &Path) -> Vec<String> {
        vec![
            "--module".to_string(),
            "mask_regions".to_string(),
            "--sample".to_string(),
            sample.to_string(),
            "-i".to_string(),
            path_arg(coverage),
            "-o".to_string(),
            path_arg(bed_out),
        ]
    }
}


/// Runs `program` with the version flag registered for `tool` and returns the
/// first line it prints. Some tools answer on stderr, so that is read when
/// stdout is empty.
///
/// # Arguments
///
/// * `tool` - Tool tag from config::defs.
/// * `program` - Program name or path actually invoked.
///
/// # Returns
/// Version line.
pub async fn check_version(tool: &str, program: &str) -> Result<String> {
    let flag = TOOL_VERSION_FLAGS
        .get(tool)
        .ok_or_else(|| anyhow!("Unknown tool: {}", tool))?;

    let mut child = Command::new(program)
        .arg(flag)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", program, e, tool))?;

    let mut lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    if lines.iter().all(|l| l.trim().is_empty()) {
        lines = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
    }
    child.wait().await?;

    let first_line = lines
        .into_iter()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("No output from {} {}", program, flag))?;
    Ok(first_line.trim().to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::config::defs::{SamtoolsSubcommand, BcftoolsSubcommand};

    #[test]
    fn test_samtools_arg_order() {
        let config = samtools::SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Rmdup,
            subcommand_fields: vec![("-S".to_string(), None)],
            positional: vec!["in.bam".to_string(), "out.bam".to_string()],
        };
        assert_eq!(samtools::arg_generator(&config), vec!["rmdup", "-S", "in.bam", "out.bam"]);
    }

    #[test]
    fn test_bcftools_fields_with_values() {
        let config = bcftools::BcftoolsConfig {
            subcommand: BcftoolsSubcommand::Call,
            subcommand_fields: vec![
                ("-cv".to_string(), None),
                ("--ploidy".to_string(), Some("1".to_string())),
                ("-Oz".to_string(), None),
                ("-o".to_string(), Some("s.vcf.gz".to_string())),
            ],
            positional: vec![],
        };
        assert_eq!(
            bcftools::arg_generator(&config),
            vec!["call", "-cv", "--ploidy", "1", "-Oz", "-o", "s.vcf.gz"]
        );
    }

    #[test]
    fn test_awk_program() {
        assert_eq!(awk::low_coverage_arg_generator(5), vec!["$3 < 5 {print $1\"\\t\"$2\"\\t\"$3}"]);
    }

    #[test]
    fn test_fastp_args() {
        let config = fastp::FastpConfig {
            in1: PathBuf::from("a_1.fastq.gz"),
            in2: PathBuf::from("a_2.fastq.gz"),
            out1: PathBuf::from("a_P1.fastq"),
            out2: PathBuf::from("a_P2.fastq"),
            html_report: PathBuf::from("fastp-a.html"),
            json_report: PathBuf::from("fastp-a.json"),
            threads: 4,
        };
        assert_eq!(
            fastp::arg_generator(&config),
            vec!["-i", "a_1.fastq.gz", "-o", "a_P1.fastq", "-I", "a_2.fastq.gz", "-O", "a_P2.fastq", "--thread", "4", "-h", "fastp-a.html", "-j", "fastp-a.json"]
        );
    }

    #[tokio::test]
    async fn test_check_version_unknown_tool() {
        assert!(check_version("not-a-tool", "true").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_check_version_bash() -> Result<()> {
        let version = check_version(crate::config::defs::BASH_TAG, "bash").await?;
        assert!(version.contains("bash"), "unexpected version line: {}", version);
        Ok(())
    }
}
