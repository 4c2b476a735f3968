//! Wrapper entry-point generation.
//!
//! The template source is an explicit value handed to the runtime at
//! construction. Placeholders are `{{Name}}` (surrounding whitespace inside
//! the braces is ignored); an unknown placeholder is an error.

use std::io;
use std::path::Path;

/// Template for the generated wrapper entry point.
#[derive(Debug, Clone)]
pub struct WrapperTemplate {
    source: String,
}

/// Values substituted into a [`WrapperTemplate`].
#[derive(Debug, Clone, Default)]
pub struct WrapperVars {
    pub work_dir: String,
    pub function_name: String,
    pub file_name: String,
    pub file_path: String,
}

impl WrapperVars {
    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "WorkDir" => Some(&self.work_dir),
            "FunctionName" => Some(&self.function_name),
            "FileName" => Some(&self.file_name),
            "FilePath" => Some(&self.file_path),
            _ => None,
        }
    }
}

impl WrapperTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self::new(std::fs::read_to_string(path)?))
    }

    pub fn render(&self, vars: &WrapperVars) -> io::Result<String> {
        let mut out = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "unterminated placeholder")
            })?;
            let key = after[..end].trim();
            let value = vars.lookup(key).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown placeholder {{{{{key}}}}}"),
                )
            })?;
            out.push_str(value);
            rest = &after[end + 2..];
        }
        out.push_str(rest);

        Ok(out)
    }

    /// Render into `dst`, replacing any existing file.
    pub fn write_to(&self, vars: &WrapperVars, dst: &Path) -> io::Result<()> {
        let rendered = self.render(vars)?;
        match std::fs::remove_file(dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        std::fs::write(dst, rendered)
    }
}
