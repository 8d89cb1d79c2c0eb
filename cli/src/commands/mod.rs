pub mod list;

use cradle_protocol::types::ProcessSpec;
use cradle_runtime::RuntimeError;
use serde::Deserialize;
use std::path::Path;

/// The OCI process document accepted by `exec --process`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciProcessFile {
    #[serde(default)]
    terminal: bool,
    #[serde(default)]
    user: OciUserFile,
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default = "default_cwd")]
    cwd: String,
}

#[derive(Debug, Default, Deserialize)]
struct OciUserFile {
    #[serde(default)]
    uid: u32,
    #[serde(default)]
    gid: u32,
}

fn default_cwd() -> String {
    "/".to_string()
}

pub fn load_process_spec(path: &Path) -> Result<ProcessSpec, RuntimeError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RuntimeError::BadRequest(format!("cannot read process spec {}: {}", path.display(), e))
    })?;
    let spec: OciProcessFile = serde_json::from_str(&content)
        .map_err(|e| RuntimeError::BadRequest(format!("malformed process spec: {}", e)))?;
    if spec.args.is_empty() {
        return Err(RuntimeError::BadRequest(
            "process spec has no args".to_string(),
        ));
    }
    Ok(ProcessSpec {
        terminal: spec.terminal,
        user: spec.user.uid.to_string(),
        group: spec.user.gid.to_string(),
        args: spec.args,
        env: spec.env,
        workdir: spec.cwd,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_process_spec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.json");
        std::fs::write(
            &path,
            r#"{"args": ["echo", "hi"], "env": ["A=b"], "cwd": "/tmp", "user": {"uid": 7, "gid": 8}}"#,
        )
        .unwrap();

        let spec = load_process_spec(&path).unwrap();
        assert_eq!(spec.args, vec!["echo", "hi"]);
        assert_eq!(spec.user, "7");
        assert_eq!(spec.group, "8");
        assert_eq!(spec.workdir, "/tmp");
    }

    #[test]
    fn test_empty_args_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("process.json");
        std::fs::write(&path, r#"{"args": []}"#).unwrap();
        assert!(matches!(
            load_process_spec(&path),
            Err(RuntimeError::BadRequest(_))
        ));
    }

    #[test]
    fn test_missing_file_rejected() {
        assert!(matches!(
            load_process_spec(Path::new("/nonexistent/process.json")),
            Err(RuntimeError::BadRequest(_))
        ));
    }
}
