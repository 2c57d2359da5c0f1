use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::defs::{
    BcftoolsSubcommand, RunConfig, SamtoolsSubcommand, CONSENSUS_PLOIDY, FASTQC_DIR, MULTIQC_DIR,
};
use crate::pipelines::plan::{ExecutionPlan, Invocation, SampleStages, Step, ToolCommand};
use crate::utils::command::bcftools::{self, BcftoolsConfig};
use crate::utils::command::bowtie2::{self, Bowtie2Config};
use crate::utils::command::fastp::{self, FastpConfig};
use crate::utils::command::samtools::{self, SamtoolsConfig};
use crate::utils::command::{awk, bedtools, fastqc, mask_regions, multiqc};
use crate::utils::file::file_path_manipulator;
use crate::utils::pairing::{ReferenceGenome, Sample};


pub const GENOME_INDEX_LABEL: &str = "Step 0: Building reference genome index";
pub const AGGREGATE_QC_LABEL: &str = "Step 5: MultiQC aggregate quality control report";

/// Number of steps each sample runs.
pub const STEPS_PER_SAMPLE: usize = 13;


/// Every file one sample produces, all under the output directory.
struct SamplePaths {
    trimmed1: PathBuf,
    trimmed2: PathBuf,
    fastp_html: PathBuf,
    fastp_json: PathBuf,
    sam: PathBuf,
    bam: PathBuf,
    flagstat: PathBuf,
    sorted_bam: PathBuf,
    duprem_bam: PathBuf,
    coverage: PathBuf,
    bed: PathBuf,
    masked_fasta: PathBuf,
    vcf: PathBuf,
    vcf_index: PathBuf,
    consensus: PathBuf,
}

impl SamplePaths {
    fn new(out_dir: &Path, name: &str) -> Self {
        let base = Path::new(name);
        let with_ext = |ext: &str| out_dir.join(format!("{}.{}", name, ext));
        Self {
            trimmed1: file_path_manipulator(base, Some(out_dir), None, Some("P1.fastq"), "_"),
            trimmed2: file_path_manipulator(base, Some(out_dir), None, Some("P2.fastq"), "_"),
            fastp_html: file_path_manipulator(&PathBuf::from(format!("{}.html", name)), Some(out_dir), Some("fastp"), None, "-"),
            fastp_json: file_path_manipulator(&PathBuf::from(format!("{}.json", name)), Some(out_dir), Some("fastp"), None, "-"),
            sam: with_ext("sam"),
            bam: with_ext("bam"),
            flagstat: with_ext("flagstat.txt"),
            sorted_bam: with_ext("sorted.bam"),
            duprem_bam: with_ext("duprem.bam"),
            coverage: file_path_manipulator(&PathBuf::from(format!("{}.txt", name)), Some(out_dir), Some("coverage"), None, "_"),
            bed: with_ext("bed"),
            masked_fasta: file_path_manipulator(base, Some(out_dir), None, Some("masked.fasta"), "_"),
            vcf: with_ext("vcf.gz"),
            vcf_index: with_ext("vcf.gz.csi"),
            consensus: file_path_manipulator(base, Some(out_dir), None, Some("genome.fa"), "_"),
        }
    }
}


fn step(label: String, command: Invocation) -> Step {
    Step { label, command }
}

fn samtools_cmd(program: &str, subcommand: SamtoolsSubcommand, fields: &[(&str, Option<&Path>)], positional: &[&Path]) -> ToolCommand {
    let config = SamtoolsConfig {
        subcommand,
        subcommand_fields: fields
            .iter()
            .map(|(flag, value)| (flag.to_string(), value.map(|v| v.to_string_lossy().into_owned())))
            .collect(),
        positional: positional.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
    };
    ToolCommand::new(program, samtools::arg_generator(&config))
}

fn bcftools_cmd(program: &str, subcommand: BcftoolsSubcommand, fields: Vec<(String, Option<String>)>, positional: &[&Path]) -> ToolCommand {
    let config = BcftoolsConfig {
        subcommand,
        subcommand_fields: fields,
        positional: positional.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
    };
    ToolCommand::new(program, bcftools::arg_generator(&config))
}


/// The thirteen steps for one sample, each consuming only the raw reads,
/// the shared genome/index, or files written by an earlier step.
fn sample_stages(config: &RunConfig, genome: &ReferenceGenome, sample: &Sample) -> SampleStages {
    let tools = &config.tools;
    let out_dir = config.out_dir.as_path();
    let fastqc_dir = out_dir.join(FASTQC_DIR);
    let name = sample.name.as_str();
    let p = SamplePaths::new(out_dir, name);

    let mut steps = Vec::with_capacity(STEPS_PER_SAMPLE);

    steps.push(step(
        format!("Step 1.1: FastQC quality control report for {}", name),
        Invocation::single(ToolCommand::new(&tools.fastqc, fastqc::arg_generator(&fastqc_dir, &sample.read1, &sample.read2)))
            .reads(&[&sample.read1, &sample.read2])
            .writes(&[&fastqc_dir]),
    ));

    let fastp_config = FastpConfig {
        in1: sample.read1.clone(),
        in2: sample.read2.clone(),
        out1: p.trimmed1.clone(),
        out2: p.trimmed2.clone(),
        html_report: p.fastp_html.clone(),
        json_report: p.fastp_json.clone(),
        threads: config.threads,
    };
    steps.push(step(
        format!("Step 1.2: Adapter and quality trimming for {}", name),
        Invocation::single(ToolCommand::new(&tools.fastp, fastp::arg_generator(&fastp_config)))
            .reads(&[&sample.read1, &sample.read2])
            .writes(&[&p.trimmed1, &p.trimmed2, &p.fastp_html, &p.fastp_json]),
    ));

    let bt2_config = Bowtie2Config {
        index_base: genome.index_base.clone(),
        threads: config.align_threads,
        in1: p.trimmed1.clone(),
        in2: p.trimmed2.clone(),
        sam_out: p.sam.clone(),
    };
    steps.push(step(
        format!("Step 2.1: Read alignment for {}", name),
        Invocation::single(ToolCommand::new(&tools.bowtie2, bowtie2::arg_generator(&bt2_config)))
            .reads(&[&genome.index_base, &p.trimmed1, &p.trimmed2])
            .writes(&[&p.sam]),
    ));

    steps.push(step(
        format!("Step 3.1: Conversion of SAM to BAM for {}", name),
        Invocation::single(samtools_cmd(&tools.samtools, SamtoolsSubcommand::View, &[("-b", None), ("-o", Some(p.bam.as_path()))], &[&p.sam]))
            .reads(&[&p.sam])
            .writes(&[&p.bam]),
    ));

    steps.push(step(
        format!("Step 3.2: Alignment metrics for {}", name),
        Invocation::single(samtools_cmd(&tools.samtools, SamtoolsSubcommand::Flagstat, &[], &[&p.bam]))
            .stdout_to(p.flagstat.clone())
            .reads(&[&p.bam])
            .writes(&[&p.flagstat]),
    ));

    steps.push(step(
        format!("Step 3.3: Sorting BAM by position for {}", name),
        Invocation::single(samtools_cmd(&tools.samtools, SamtoolsSubcommand::Sort, &[("-o", Some(p.sorted_bam.as_path()))], &[&p.bam]))
            .reads(&[&p.bam])
            .writes(&[&p.sorted_bam]),
    ));

    steps.push(step(
        format!("Step 3.4: Removing duplicate reads for {}", name),
        Invocation::single(samtools_cmd(&tools.samtools, SamtoolsSubcommand::Rmdup, &[("-S", None)], &[&p.sorted_bam, &p.duprem_bam]))
            .reads(&[&p.sorted_bam])
            .writes(&[&p.duprem_bam]),
    ));

    steps.push(step(
        format!("Step 3.5: Deriving low coverage positions for {}", name),
        Invocation::piped(vec![
            samtools_cmd(&tools.samtools, SamtoolsSubcommand::Depth, &[], &[&p.duprem_bam]),
            ToolCommand::new(&tools.awk, awk::low_coverage_arg_generator(config.min_depth)),
        ])
        .stdout_to(p.coverage.clone())
        .reads(&[&p.duprem_bam])
        .writes(&[&p.coverage]),
    ));

    steps.push(step(
        format!("Step 3.6: Extracting masked region coordinates for {}", name),
        Invocation::single(ToolCommand::new(&tools.mask_regions, mask_regions::arg_generator(name, &p.coverage, &p.bed)))
            .reads(&[&p.coverage])
            .writes(&[&p.bed]),
    ));

    steps.push(step(
        format!("Step 3.7: N-masking the reference for {}", name),
        Invocation::single(ToolCommand::new(&tools.bedtools, bedtools::maskfasta_arg_generator(&genome.fasta, &p.bed, &p.masked_fasta)))
            .reads(&[&genome.fasta, &p.bed])
            .writes(&[&p.masked_fasta]),
    ));

    steps.push(step(
        format!("Step 4.1: Variant calling for {}", name),
        Invocation::piped(vec![
            bcftools_cmd(
                &tools.bcftools,
                BcftoolsSubcommand::Mpileup,
                vec![("-f".to_string(), Some(genome.fasta.to_string_lossy().into_owned()))],
                &[&p.duprem_bam],
            ),
            bcftools_cmd(
                &tools.bcftools,
                BcftoolsSubcommand::Call,
                vec![
                    ("-cv".to_string(), None),
                    ("--ploidy".to_string(), Some(CONSENSUS_PLOIDY.to_string())),
                    ("-Oz".to_string(), None),
                    ("-o".to_string(), Some(p.vcf.to_string_lossy().into_owned())),
                ],
                &[],
            ),
        ])
        .reads(&[&genome.fasta, &p.duprem_bam])
        .writes(&[&p.vcf]),
    ));

    steps.push(step(
        format!("Step 4.2: Indexing variants for {}", name),
        Invocation::single(bcftools_cmd(&tools.bcftools, BcftoolsSubcommand::Index, Vec::new(), &[&p.vcf]))
            .reads(&[&p.vcf])
            .writes(&[&p.vcf_index]),
    ));

    steps.push(step(
        format!("Step 4.3: Generating consensus genome for {}", name),
        Invocation::single(bcftools_cmd(
            &tools.bcftools,
            BcftoolsSubcommand::Consensus,
            vec![
                ("-f".to_string(), Some(p.masked_fasta.to_string_lossy().into_owned())),
                ("-o".to_string(), Some(p.consensus.to_string_lossy().into_owned())),
            ],
            &[&p.vcf],
        ))
        .reads(&[&p.masked_fasta, &p.vcf, &p.vcf_index])
        .writes(&[&p.consensus]),
    ));

    debug!("Planned {} steps for sample {}", steps.len(), name);
    SampleStages {
        sample: sample.name.clone(),
        steps,
    }
}


/// Builds the consensus genome plan: genome index once, the per-sample
/// stages in resolution order, then one aggregate QC report.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `genome` - Reference genome and its index base.
/// * `samples` - Resolved samples, in order.
///
/// # Returns
/// ExecutionPlan, identical for identical inputs.
pub fn generate_plan(config: &RunConfig, genome: &ReferenceGenome, samples: &[Sample]) -> ExecutionPlan {
    let tools = &config.tools;
    let out_dir = config.out_dir.clone();
    let fastqc_dir = out_dir.join(FASTQC_DIR);
    let multiqc_dir = out_dir.join(MULTIQC_DIR);

    let genome_index = step(
        GENOME_INDEX_LABEL.to_string(),
        Invocation::single(ToolCommand::new(
            &tools.bowtie2_build,
            bowtie2::build_arg_generator(&genome.fasta, &genome.index_base),
        ))
        .reads(&[&genome.fasta])
        .writes(&[&genome.index_base]),
    );

    let stages: Vec<SampleStages> = samples
        .iter()
        .map(|sample| sample_stages(config, genome, sample))
        .collect();

    let aggregate = step(
        AGGREGATE_QC_LABEL.to_string(),
        Invocation::single(ToolCommand::new(
            &tools.multiqc,
            multiqc::arg_generator(&[&fastqc_dir, &out_dir], &multiqc_dir),
        ))
        .reads(&[&fastqc_dir, &out_dir])
        .writes(&[&multiqc_dir]),
    );

    let plan = ExecutionPlan {
        directories: vec![out_dir.clone(), fastqc_dir, multiqc_dir],
        out_dir,
        genome_index,
        samples: stages,
        aggregate,
    };
    info!("Generated plan with {} steps for {} sample(s)", plan.len(), samples.len());
    plan
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use crate::config::defs::ToolPaths;

    fn fixture(names: &[&str]) -> (RunConfig, ReferenceGenome, Vec<Sample>) {
        let config = RunConfig::with_defaults(PathBuf::from("/work"), PathBuf::from("/work/out"));
        let genome = ReferenceGenome::from_fasta(Path::new("/uploads/ref.fasta"));
        let samples = names
            .iter()
            .map(|n| Sample {
                name: n.to_string(),
                read1: PathBuf::from(format!("/uploads/{}_1.fastq.gz", n)),
                read2: PathBuf::from(format!("/uploads/{}_2.fastq.gz", n)),
            })
            .collect();
        (config, genome, samples)
    }

    #[test]
    fn test_single_sample_has_fifteen_entries() {
        let (config, genome, samples) = fixture(&["s1"]);
        let plan = generate_plan(&config, &genome, &samples);
        assert_eq!(plan.len(), 15);
        assert_eq!(plan.samples[0].steps.len(), STEPS_PER_SAMPLE);

        let labels = plan.labels();
        assert_eq!(labels.first().map(String::as_str), Some(GENOME_INDEX_LABEL));
        assert_eq!(labels.last().map(String::as_str), Some(AGGREGATE_QC_LABEL));
    }

    #[test]
    fn test_stage_order_per_sample() {
        let (config, genome, samples) = fixture(&["a", "b"]);
        let plan = generate_plan(&config, &genome, &samples);
        let expected_prefixes = [
            "Step 1.1", "Step 1.2", "Step 2.1", "Step 3.1", "Step 3.2", "Step 3.3", "Step 3.4",
            "Step 3.5", "Step 3.6", "Step 3.7", "Step 4.1", "Step 4.2", "Step 4.3",
        ];
        for (group, name) in plan.samples.iter().zip(["a", "b"]) {
            assert_eq!(group.sample, name);
            for (step, prefix) in group.steps.iter().zip(expected_prefixes) {
                assert!(step.label.starts_with(prefix), "{} should start with {}", step.label, prefix);
                assert!(step.label.ends_with(&format!("for {}", name)));
            }
        }
    }

    #[test]
    fn test_steps_only_consume_earlier_outputs() {
        let (config, genome, samples) = fixture(&["s1", "s2"]);
        let plan = generate_plan(&config, &genome, &samples);
        for (group, sample) in plan.samples.iter().zip(&samples) {
            let mut available: HashSet<PathBuf> = HashSet::new();
            available.insert(sample.read1.clone());
            available.insert(sample.read2.clone());
            available.insert(genome.fasta.clone());
            available.extend(plan.genome_index.command.outputs.iter().cloned());

            for step in &group.steps {
                for input in &step.command.inputs {
                    assert!(available.contains(input), "{} reads {} before it exists", step.label, input.display());
                }
                for output in &step.command.outputs {
                    let shared = output.ends_with(FASTQC_DIR);
                    assert!(shared || output.to_string_lossy().contains(group.sample.as_str()),
                        "{} writes {} outside sample {}", step.label, output.display(), group.sample);
                }
                available.extend(step.command.outputs.iter().cloned());
            }
        }
    }

    #[test]
    fn test_plan_is_deterministic() {
        let (config, genome, samples) = fixture(&["s1", "s2", "s3"]);
        let first = generate_plan(&config, &genome, &samples);
        let second = generate_plan(&config, &genome, &samples);
        assert_eq!(first, second);
        assert_eq!(first.render_script(), second.render_script());
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn test_threading_of_key_paths() {
        let (config, genome, samples) = fixture(&["s1"]);
        let plan = generate_plan(&config, &genome, &samples);
        let steps = &plan.samples[0].steps;

        assert_eq!(
            steps[2].command.pipeline[0].args,
            vec!["-p", "4", "-x", "/uploads/ref", "-1", "/work/out/s1_P1.fastq", "-2", "/work/out/s1_P2.fastq", "-S", "/work/out/s1.sam"]
        );
        assert_eq!(steps[3].command.pipeline[0].args, vec!["view", "-b", "-o", "/work/out/s1.bam", "/work/out/s1.sam"]);
        assert_eq!(steps[7].command.stdout, Some(PathBuf::from("/work/out/coverage_s1.txt")));
        assert_eq!(steps[7].command.pipeline[0].args, vec!["depth", "/work/out/s1.duprem.bam"]);
        assert_eq!(
            steps[9].command.pipeline[0].args,
            vec!["maskfasta", "-fi", "/uploads/ref.fasta", "-bed", "/work/out/s1.bed", "-mc", "N", "-fo", "/work/out/s1_masked.fasta"]
        );
        assert_eq!(
            steps[12].command.pipeline[0].args,
            vec!["consensus", "-f", "/work/out/s1_masked.fasta", "-o", "/work/out/s1_genome.fa", "/work/out/s1.vcf.gz"]
        );
    }

    #[test]
    fn test_thread_counts_come_from_config_only() {
        let (mut config, genome, samples) = fixture(&["s1"]);
        let steps = generate_plan(&config, &genome, &samples).samples[0].steps.clone();
        assert_eq!(steps[1].command.pipeline[0].args[8..10], ["--thread", "4"]);
        assert_eq!(steps[2].command.pipeline[0].args[0..2], ["-p", "4"]);

        config.threads = 2;
        config.align_threads = 12;
        let steps = generate_plan(&config, &genome, &samples).samples[0].steps.clone();
        assert_eq!(steps[1].command.pipeline[0].args[8..10], ["--thread", "2"]);
        assert_eq!(steps[2].command.pipeline[0].args[0..2], ["-p", "12"]);
    }

    #[test]
    fn test_tool_overrides_are_used() {
        let (mut config, genome, samples) = fixture(&["s1"]);
        config.tools = ToolPaths::all("/opt/fake-tool");
        let plan = generate_plan(&config, &genome, &samples);
        for step in plan.steps() {
            for command in &step.command.pipeline {
                assert_eq!(command.program, "/opt/fake-tool");
            }
        }
    }
}
