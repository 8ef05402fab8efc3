//! Optional file sink: one JSON document per cluster, overwritten each cycle.

use std::path::PathBuf;

use crate::error::OutputError;
use crate::flamegraph::FlameGraph;

pub struct FileOutput {
    dir: PathBuf,
}

impl FileOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `stacks_<cluster>.json`, with path separators in the cluster name
    /// replaced so the file always lands in `dir`.
    pub fn path_for(&self, cluster: &str) -> PathBuf {
        let safe: String = cluster
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("stacks_{}.json", safe))
    }

    pub async fn write(&self, graph: &FlameGraph) -> Result<PathBuf, OutputError> {
        let path = self.path_for(graph.cluster());
        let mut body = serde_json::to_vec(graph)?;
        body.push(b'\n');

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_for_sanitizes_separators() {
        let output = FileOutput::new("/var/lib/nsflame");
        assert_eq!(output.path_for("prod"), PathBuf::from("/var/lib/nsflame/stacks_prod.json"));
        assert_eq!(output.path_for("../etc"), PathBuf::from("/var/lib/nsflame/stacks_.._etc.json"));
    }

    #[tokio::test]
    async fn test_write_overwrites_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileOutput::new(dir.path().join("stacks"));

        let first = FlameGraph::build("prod", &["a.b.c", "a.d", "e.f"]);
        let path = output.write(&first).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["value"], 3);
        assert_eq!(json["children"].as_array().unwrap().len(), 2);

        let second = FlameGraph::build("prod", &["x.y"]);
        assert_eq!(output.write(&second).await.unwrap(), path);
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["value"], 1);
        assert_eq!(json["children"][0]["name"], "x");
    }
}
