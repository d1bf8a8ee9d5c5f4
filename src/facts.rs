use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::oval::OvalSummary;

#[derive(Debug, Serialize)]
pub struct Facts {
    pub openscap: Openscap,
}

#[derive(Debug, Serialize)]
pub struct Openscap {
    pub oval: OvalSummary,
}

impl Facts {
    pub fn new(oval: OvalSummary) -> Facts {
        Facts {
            openscap: Openscap { oval },
        }
    }
}

/// Serializes the facts as yaml and replaces `path` atomically. The fact
/// file ends up owner read/write only no matter what the destination had
/// before.
pub fn write_fact_file(path: &Path, facts: &Facts) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(facts)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("bad fact file path {}", path.display()))?;
    let tmp = path.with_file_name(format!("{file_name}.tmp"));

    fs::write(&tmp, format!("---\n{yaml}"))
        .with_context(|| format!("writing {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600)) {
            let _ = fs::remove_file(&tmp);
            return Err(e)
                .with_context(|| format!("setting permissions on {}", tmp.display()));
        }
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("renaming over {}", path.display()));
    }
    Ok(())
}
