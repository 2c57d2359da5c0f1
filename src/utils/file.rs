use std::fs;
use std::io;
use std::path::{Path, PathBuf};


/// Builds a path of the form `<dir>/<prefix><delim><name><delim><suffix>`.
/// Prefix and suffix are optional; the delimiter is only placed next to the
/// parts that are present. Relative `base` names are joined to `dir`.
///
/// # Arguments
///
/// * `base` - File name (or path) of the core part of the new name.
/// * `dir` - Optional directory for the result; defaults to the parent of `base`.
/// * `prefix` - Optional prefix placed in front of the file name.
/// * `suffix` - Optional suffix placed after the file name.
/// * `delimiter` - Joins prefix/name/suffix.
///
/// # Returns
/// PathBuf
pub fn file_path_manipulator(
    base: &Path,
    dir: Option<&Path>,
    prefix: Option<&str>,
    suffix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut file_name = String::new();
    if let Some(prefix) = prefix {
        file_name.push_str(prefix);
        file_name.push_str(delimiter);
    }
    file_name.push_str(&name);
    if let Some(suffix) = suffix {
        file_name.push_str(delimiter);
        file_name.push_str(suffix);
    }

    match dir {
        Some(dir) => dir.join(file_name),
        None => match base.parent() {
            Some(parent) => parent.join(file_name),
            None => PathBuf::from(file_name),
        },
    }
}


/// Writes a script to disk and marks it executable (0755 on unix).
pub fn write_executable(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(())
}


/// Resolves a possibly relative path against `cwd`.
pub fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_path_manipulator_suffix() {
        let p = file_path_manipulator(Path::new("s1"), Some(Path::new("/out")), None, Some("P1.fastq"), "_");
        assert_eq!(p, PathBuf::from("/out/s1_P1.fastq"));
    }

    #[test]
    fn test_file_path_manipulator_prefix_only() {
        let p = file_path_manipulator(Path::new("s1.html"), Some(Path::new("/out")), Some("fastp"), None, "-");
        assert_eq!(p, PathBuf::from("/out/fastp-s1.html"));
    }

    #[test]
    fn test_file_path_manipulator_defaults_to_parent() {
        let p = file_path_manipulator(Path::new("/uploads/s1_R1.fastq.gz"), None, Some("old"), None, ".");
        assert_eq!(p, PathBuf::from("/uploads/old.s1_R1.fastq.gz"));
    }

    #[test]
    fn test_absolutize() {
        assert_eq!(absolutize(Path::new("a/b"), Path::new("/cwd")), PathBuf::from("/cwd/a/b"));
        assert_eq!(absolutize(Path::new("/x"), Path::new("/cwd")), PathBuf::from("/x"));
    }
}
