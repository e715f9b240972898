//! Subsetter that shells out to a `pyftsubset`-compatible command.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cmap::FontContainer;
use crate::coordinator::{FontSubsetter, SubsetJob, SubsetOutput};
use crate::error::{ErrorPhase, SubfontError};

static NEXT_JOB: AtomicUsize = AtomicUsize::new(0);

/// Runs `<program> <input> --unicodes=... --output-file=<output>` per job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSubsetter {
    program: String,
    extra_args: Vec<String>,
}

impl Default for CommandSubsetter {
    fn default() -> Self {
        Self::new("pyftsubset")
    }
}

impl CommandSubsetter {
    /// Subsetter invoking `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            extra_args: vec![
                "--layout-features=*".to_string(),
                "--name-IDs=*".to_string(),
                "--name-languages=*".to_string(),
                "--notdef-outline".to_string(),
            ],
        }
    }

    /// Append an argument passed to every invocation.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Full argument list for one job.
    pub fn args_for(&self, job: &SubsetJob, input: &str, output: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.extra_args.len() + 4);
        args.push(input.to_string());
        args.push(unicodes_arg(job));
        args.push(format!("--output-file={}", output));
        if matches!(job.container, FontContainer::Collection { .. }) {
            args.push(format!("--font-number={}", job.face_index));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

fn unicodes_arg(job: &SubsetJob) -> String {
    let list: Vec<String> = job
        .codepoints
        .iter()
        .map(|cp| format!("U+{:04X}", cp))
        .collect();
    format!("--unicodes={}", list.join(","))
}

struct ScratchFiles {
    input: PathBuf,
    output: PathBuf,
}

impl ScratchFiles {
    fn new() -> Self {
        let n = NEXT_JOB.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir();
        let pid = std::process::id();
        Self {
            input: dir.join(format!("epub-subfont-{}-{}-in.font", pid, n)),
            output: dir.join(format!("epub-subfont-{}-{}-out.font", pid, n)),
        }
    }
}

impl Drop for ScratchFiles {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.input);
        let _ = fs::remove_file(&self.output);
    }
}

impl FontSubsetter for CommandSubsetter {
    fn subset(&self, job: &SubsetJob) -> Result<SubsetOutput, SubfontError> {
        let scratch = ScratchFiles::new();
        let fail = |message: String| {
            SubfontError::new(ErrorPhase::Subset, "SUBSET_FAILED", message)
                .with_path(job.font_name.clone())
        };
        fs::write(&scratch.input, &job.font)
            .map_err(|err| fail(format!("cannot write scratch input: {}", err)))?;

        let args = self.args_for(
            job,
            &scratch.input.to_string_lossy(),
            &scratch.output.to_string_lossy(),
        );
        log::debug!("{} {} ({} code points)", self.program, job.font_name, job.codepoints.len());
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|err| fail(format!("cannot run {}: {}", self.program, err)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "{} exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        let data = fs::read(&scratch.output)
            .map_err(|err| fail(format!("no output from {}: {}", self.program, err)))?;
        Ok(SubsetOutput { data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn arguments_list_codepoints_and_face() {
        let job = SubsetJob {
            font_name: "a.ttc".to_string(),
            font: Vec::new(),
            face_index: 0,
            container: FontContainer::Collection { faces: 2 },
            codepoints: BTreeSet::from([0x41, 0x7684]),
        };
        let args = CommandSubsetter::new("subset-tool").args_for(&job, "in", "out");
        assert_eq!(&args[..4], &[
            "in".to_string(),
            "--unicodes=U+0041,U+7684".to_string(),
            "--output-file=out".to_string(),
            "--font-number=0".to_string(),
        ]);
    }

    #[test]
    fn missing_program_fails_the_job() {
        let job = SubsetJob {
            font_name: "a.ttf".to_string(),
            font: vec![0, 1, 0, 0],
            face_index: 0,
            container: FontContainer::Single,
            codepoints: BTreeSet::from([0x41]),
        };
        let err = CommandSubsetter::new("epub-subfont-no-such-program")
            .subset(&job)
            .expect_err("missing program");
        assert_eq!(err.code, "SUBSET_FAILED");
    }
}
