//! SLSA provenance statement for uploaded artifacts
//!
//! Writes `<wd>/<name>-metadata.json`: an in-toto v0.1 statement whose
//! subjects are the regular files of the artifact (with SHA-256 digests)
//! and whose predicate is a SLSA v1 provenance record describing the job.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{HelperError, HelperResult};
use runner_archive::FileSet;

/// in-toto statement type.
pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v0.1";

/// SLSA v1 provenance predicate type.
pub const PREDICATE_TYPE: &str = "https://slsa.dev/provenance/v1";

/// Version reported in `buildType` and `builder.version`.
pub const BUILDER_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

const BUFFER_SIZE: usize = 64 * 1024;

/// Provenance flags of `artifacts-uploader`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ProvenanceArgs {
    /// Generate a provenance statement for the uploaded artifacts
    #[arg(long, env = "GENERATE_ARTIFACTS_METADATA")]
    pub generate_artifacts_metadata: bool,

    #[arg(long, env = "RUNNER_ID", default_value_t = 0)]
    pub runner_id: i64,

    #[arg(long, env = "REPO_URL", default_value = "")]
    pub repo_url: String,

    #[arg(long, env = "REPO_DIGEST", default_value = "")]
    pub repo_digest: String,

    #[arg(long, env = "JOB_NAME", default_value = "")]
    pub job_name: String,

    #[arg(long, env = "EXECUTOR_NAME", default_value = "")]
    pub executor_name: String,

    #[arg(long, env = "RUNNER_NAME", default_value = "")]
    pub runner_name: String,

    /// Name of a job variable recorded as an external parameter
    #[arg(long = "metadata-parameter")]
    pub parameters: Vec<String>,

    /// Job start time (RFC 3339)
    #[arg(long, env = "STARTED_AT", default_value = "")]
    pub started_at: String,

    /// Job end time (RFC 3339)
    #[arg(long, env = "ENDED_AT", default_value = "")]
    pub ended_at: String,

    #[arg(long, env = "SCHEMA_VERSION", default_value = "v1")]
    pub schema_version: String,
}

/// Name plus digest set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub digest: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    pub subject: Vec<ResourceDescriptor>,
    #[serde(rename = "predicateType")]
    pub predicate_type: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub build_definition: BuildDefinition,
    pub run_details: RunDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDefinition {
    pub build_type: String,
    pub external_parameters: BTreeMap<String, String>,
    pub internal_parameters: BTreeMap<String, String>,
    pub resolved_dependencies: Vec<ResourceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetails {
    pub builder: Builder,
    pub metadata: BuildMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builder {
    pub id: String,
    pub version: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetadata {
    pub invocation_id: String,
    pub started_on: DateTime<Utc>,
    pub finished_on: DateTime<Utc>,
}

/// Inputs that vary per upload.
pub struct GenerateOptions<'a> {
    pub artifact_name: &'a str,
    pub files: &'a FileSet,
    pub wd: &'a Path,
    pub job_id: i64,
}

impl ProvenanceArgs {
    /// Build the statement for one artifact.
    pub fn generate(&self, opts: &GenerateOptions<'_>) -> HelperResult<Statement> {
        if self.schema_version != "v1" {
            tracing::warn!(
                schema_version = %self.schema_version,
                "unknown provenance schema version, using v1"
            );
        }

        let subject = subjects(opts.wd, opts.files)?;
        let started_on = parse_time("started-at", &self.started_at)?;
        let finished_on = parse_time("ended-at", &self.ended_at)?;
        let job = opts.job_id.to_string();

        let mut external_parameters: BTreeMap<String, String> = self
            .parameters
            .iter()
            .map(|p| (p.clone(), String::new()))
            .collect();
        external_parameters.insert("entryPoint".into(), self.job_name.clone());
        external_parameters.insert("source".into(), self.repo_url.clone());

        let internal_parameters = BTreeMap::from([
            ("name".to_string(), self.runner_name.clone()),
            ("executor".to_string(), self.executor_name.clone()),
            ("architecture".to_string(), std::env::consts::ARCH.to_string()),
            ("job".to_string(), job.clone()),
        ]);

        let resolved_dependencies = vec![ResourceDescriptor {
            uri: self.repo_url.clone(),
            name: String::new(),
            digest: BTreeMap::from([("sha256".to_string(), self.repo_digest.clone())]),
        }];

        Ok(Statement {
            statement_type: STATEMENT_TYPE.to_string(),
            subject,
            predicate_type: PREDICATE_TYPE.to_string(),
            predicate: Predicate {
                build_definition: BuildDefinition {
                    build_type: format!(
                        "https://gitlab.com/gitlab-org/gitlab-runner/-/blob/{BUILDER_VERSION}/PROVENANCE.md"
                    ),
                    external_parameters,
                    internal_parameters,
                    resolved_dependencies,
                },
                run_details: RunDetails {
                    builder: Builder {
                        id: format!("{}/-/runners/{}", self.repo_url, self.runner_id),
                        version: BTreeMap::from([(
                            "gitlab-runner".to_string(),
                            BUILDER_VERSION.to_string(),
                        )]),
                    },
                    metadata: BuildMetadata {
                        invocation_id: job,
                        started_on,
                        finished_on,
                    },
                },
            },
        })
    }

    /// Generate and write `<wd>/<name>-metadata.json`; returns its path.
    pub fn generate_to_file(&self, opts: &GenerateOptions<'_>) -> HelperResult<PathBuf> {
        let statement = self.generate(opts)?;
        let path = opts.wd.join(format!("{}-metadata.json", opts.artifact_name));
        let json = serde_json::to_vec_pretty(&statement)?;
        fs::write(&path, json)?;
        tracing::info!(path = %path.display(), subjects = statement.subject.len(), "wrote provenance statement");
        Ok(path)
    }
}

fn parse_time(flag: &str, value: &str) -> HelperResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| HelperError::InvalidInput(format!("--{flag} {value:?}: {e}")))
}

/// One descriptor per regular file, in pathname order.
fn subjects(wd: &Path, files: &FileSet) -> HelperResult<Vec<ResourceDescriptor>> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut out = Vec::new();

    for (name, md) in files {
        if !md.file_type().is_file() {
            continue;
        }
        let mut file = File::open(wd.join(name))?;
        let digest = hash_reader(&mut hasher, &mut buf, &mut file)?;
        out.push(ResourceDescriptor {
            uri: String::new(),
            name: name.clone(),
            digest: BTreeMap::from([("sha256".to_string(), digest)]),
        });
    }
    Ok(out)
}

fn hash_reader<R: Read>(hasher: &mut Sha256, buf: &mut [u8], reader: &mut R) -> io::Result<String> {
    loop {
        match reader.read(buf) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(hex::encode(hasher.finalize_reset()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args() -> ProvenanceArgs {
        ProvenanceArgs {
            generate_artifacts_metadata: true,
            runner_id: 7,
            repo_url: "https://gitlab.example.com/group/project".into(),
            repo_digest: "abc123".into(),
            job_name: "build".into(),
            executor_name: "docker".into(),
            runner_name: "runner-1".into(),
            parameters: vec!["CI_COMMIT_SHA".into()],
            started_at: "2024-01-02T03:04:05Z".into(),
            ended_at: "2024-01-02T03:14:05+00:00".into(),
            schema_version: "v1".into(),
        }
    }

    fn selection(dir: &Path) -> FileSet {
        fs::write(dir.join("hello.txt"), "hello").unwrap();
        fs::create_dir(dir.join("sub")).unwrap();
        let mut files = FileSet::new();
        files.insert("hello.txt".into(), fs::symlink_metadata(dir.join("hello.txt")).unwrap());
        files.insert("sub".into(), fs::symlink_metadata(dir.join("sub")).unwrap());
        files
    }

    #[test]
    fn test_statement_fields() {
        let dir = TempDir::new().unwrap();
        let files = selection(dir.path());
        let statement = args()
            .generate(&GenerateOptions {
                artifact_name: "artifacts",
                files: &files,
                wd: dir.path(),
                job_id: 42,
            })
            .unwrap();

        assert_eq!(statement.statement_type, STATEMENT_TYPE);
        assert_eq!(statement.predicate_type, PREDICATE_TYPE);
        assert_eq!(statement.subject.len(), 1);
        assert_eq!(statement.subject[0].name, "hello.txt");
        assert_eq!(
            statement.subject[0].digest["sha256"],
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let def = &statement.predicate.build_definition;
        assert_eq!(def.external_parameters["entryPoint"], "build");
        assert_eq!(def.external_parameters["source"], "https://gitlab.example.com/group/project");
        assert_eq!(def.external_parameters["CI_COMMIT_SHA"], "");
        assert_eq!(def.internal_parameters["job"], "42");
        assert!(def.build_type.ends_with("/PROVENANCE.md"));

        let run = &statement.predicate.run_details;
        assert_eq!(run.builder.id, "https://gitlab.example.com/group/project/-/runners/7");
        assert_eq!(run.metadata.invocation_id, "42");
        assert_eq!((run.metadata.finished_on - run.metadata.started_on).num_minutes(), 10);
    }

    #[test]
    fn test_malformed_time_aborts() {
        let dir = TempDir::new().unwrap();
        let files = FileSet::new();
        let mut bad = args();
        bad.ended_at = "yesterday".into();
        let err = bad
            .generate(&GenerateOptions {
                artifact_name: "a",
                files: &files,
                wd: dir.path(),
                job_id: 1,
            })
            .unwrap_err();
        assert!(err.to_string().contains("ended-at"));
    }

    #[test]
    fn test_written_json_shape() {
        let dir = TempDir::new().unwrap();
        let files = selection(dir.path());
        let path = args()
            .generate_to_file(&GenerateOptions {
                artifact_name: "report",
                files: &files,
                wd: dir.path(),
                job_id: 9,
            })
            .unwrap();
        assert_eq!(path, dir.path().join("report-metadata.json"));

        let value: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        assert_eq!(value["_type"], STATEMENT_TYPE);
        assert_eq!(value["predicateType"], PREDICATE_TYPE);
        assert_eq!(
            value["predicate"]["runDetails"]["builder"]["version"]["gitlab-runner"],
            BUILDER_VERSION
        );
        assert_eq!(
            value["predicate"]["buildDefinition"]["resolvedDependencies"][0]["digest"]["sha256"],
            "abc123"
        );
        assert!(value["predicate"]["runDetails"]["metadata"]["startedOn"].is_string());
    }
}
