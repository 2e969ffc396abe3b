//! Test support: a scripted [`CommandRunner`]
//!
//! [`FakeRunner`] records every invocation and emulates the file-system effects
//! of the easy-rsa, openvpn and wg subcommands the provisioner uses, so PKI
//! behaviour can be exercised inside a temp directory without root or tools.

use crate::exec::{CommandOutput, CommandRunner, CommandSpec};
use crate::fsutil::digest;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// How an injected failure manifests
#[derive(Debug, Clone)]
pub enum FakeFailure {
    /// Nonzero exit with this stderr
    Exit(String),
    /// The invocation exceeds its timeout
    Timeout,
    /// The binary cannot be spawned
    Missing,
}

/// Scripted command runner with tool emulation
#[derive(Debug, Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    failures: Mutex<HashMap<String, FakeFailure>>,
    counter: AtomicU32,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every invocation whose first tool argument is `subcommand`
    /// (e.g. `gen-dh`, `build-client-full`, `genkey`, `which`).
    pub fn fail_on(&self, subcommand: &str, failure: FakeFailure) {
        self.failures.lock().insert(subcommand.to_string(), failure);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().clone()
    }

    /// Number of recorded invocations of `subcommand`.
    pub fn count(&self, subcommand: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.tool_args().first().map(String::as_str) == Some(subcommand))
            .count()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    fn next(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn emulate(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let args = spec.tool_args();
        let sub = args.first().map(String::as_str).unwrap_or("");
        let tool = Path::new(spec.tool())
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        match tool.as_str() {
            "easyrsa" => {
                let pki = spec
                    .env
                    .get("EASYRSA_PKI")
                    .map(PathBuf::from)
                    .ok_or_else(|| Error::Internal("EASYRSA_PKI not set".to_string()))?;
                Ok(emulate_easyrsa(&pki, args))
            }
            "openvpn" if sub == "--genkey" => {
                let Some(path) = args.get(2) else {
                    return Ok(CommandOutput::failed("missing key file"));
                };
                write(Path::new(path), &format!(
                    "-----BEGIN OpenVPN Static key V1-----\n{}\n-----END OpenVPN Static key V1-----\n",
                    digest(path)
                ))?;
                Ok(CommandOutput::ok(""))
            }
            "wg" => match sub {
                "genkey" => Ok(CommandOutput::ok(format!("private-{:04}-key=\n", self.next()))),
                "genpsk" => Ok(CommandOutput::ok(format!("psk-{:04}-key=\n", self.next()))),
                "pubkey" => {
                    let private = spec.stdin.clone().unwrap_or_default();
                    Ok(CommandOutput::ok(format!("pub-{}=\n", &digest(private.trim())[..40])))
                }
                _ => Ok(CommandOutput::ok("")),
            },
            _ => Ok(CommandOutput::ok("")),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.calls.lock().push(spec.clone());

        let sub = spec.tool_args().first().cloned().unwrap_or_default();
        let failure = self.failures.lock().get(&sub).cloned();
        match failure {
            Some(FakeFailure::Exit(stderr)) => return Ok(CommandOutput::failed(stderr)),
            Some(FakeFailure::Timeout) => {
                return Err(Error::Timeout {
                    program: spec.tool().to_string(),
                    seconds: spec.timeout.as_secs(),
                })
            }
            Some(FakeFailure::Missing) => {
                return Err(Error::NotInstalled {
                    program: spec.tool().to_string(),
                })
            }
            None => {}
        }

        self.emulate(spec)
    }
}

fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, contents)?;
    Ok(())
}

fn pem(label: &str, body: &str) -> String {
    format!("-----BEGIN {label}-----\n{body}\n-----END {label}-----\n")
}

fn emulate_easyrsa(pki: &Path, args: &[String]) -> CommandOutput {
    match try_easyrsa(pki, args) {
        Ok(output) => output,
        Err(e) => CommandOutput::failed(e.to_string()),
    }
}

fn try_easyrsa(pki: &Path, args: &[String]) -> Result<CommandOutput> {
    let sub = args.first().map(String::as_str).unwrap_or("");
    let initialized = pki.join("openssl-easyrsa.cnf").exists();

    if sub == "--version" {
        return Ok(CommandOutput::ok("EasyRSA Version Information\nVersion: 3.1.7"));
    }
    if sub != "init-pki" && !initialized {
        return Ok(CommandOutput::failed("EASYRSA_PKI does not exist (perhaps you need to run init-pki)?"));
    }

    match sub {
        "init-pki" => {
            for dir in ["private", "issued", "reqs", "revoked/certs_by_serial"] {
                fs::create_dir_all(pki.join(dir))?;
            }
            write(&pki.join("openssl-easyrsa.cnf"), "# easy-rsa openssl config\n")?;
            write(&pki.join("index.txt"), "")?;
            Ok(CommandOutput::ok("init-pki complete"))
        }
        "build-ca" => {
            if pki.join("ca.crt").exists() {
                return Ok(CommandOutput::failed("Unable to create a CA as you already seem to have one set up."));
            }
            write(&pki.join("private/ca.key"), &pem("PRIVATE KEY", "fake-ca-key"))?;
            write(&pki.join("ca.crt"), &pem("CERTIFICATE", "fake-ca"))?;
            Ok(CommandOutput::ok("CA creation complete"))
        }
        "build-server-full" | "build-client-full" => {
            let Some(name) = args.get(1) else {
                return Ok(CommandOutput::failed("missing entity name"));
            };
            if !pki.join("ca.crt").exists() {
                return Ok(CommandOutput::failed("Missing expected CA file: ca.crt"));
            }
            let issued = pki.join("issued").join(format!("{name}.crt"));
            if issued.exists() {
                return Ok(CommandOutput::failed(format!("Request file already exists: {name}")));
            }
            write(&pki.join("reqs").join(format!("{name}.req")), &pem("CERTIFICATE REQUEST", name))?;
            write(&pki.join("private").join(format!("{name}.key")), &pem("PRIVATE KEY", &format!("key-{name}")))?;
            write(&issued, &pem("CERTIFICATE", &format!("cert-{name}")))?;
            append_index(pki, &format!("V\t{name}\n"))?;
            Ok(CommandOutput::ok(format!("Certificate created at: {}", issued.display())))
        }
        "gen-dh" => {
            write(&pki.join("dh.pem"), &pem("DH PARAMETERS", "fake-dh"))?;
            Ok(CommandOutput::ok("DH parameters generated"))
        }
        "revoke" => {
            let Some(name) = args.get(1) else {
                return Ok(CommandOutput::failed("missing entity name"));
            };
            let issued = pki.join("issued").join(format!("{name}.crt"));
            if !issued.exists() {
                return Ok(CommandOutput::failed(format!(
                    "Unable to revoke as no certificate was found. Certificate was expected at: {}",
                    issued.display()
                )));
            }
            let serial = digest(&format!("{name}-{}", fs::read_to_string(pki.join("index.txt"))?.len()));
            fs::rename(
                &issued,
                pki.join("revoked/certs_by_serial").join(format!("{}.crt", &serial[..16])),
            )?;
            let _ = fs::remove_file(pki.join("private").join(format!("{name}.key")));
            let _ = fs::remove_file(pki.join("reqs").join(format!("{name}.req")));
            append_index(pki, &format!("R\t{name}\n"))?;
            Ok(CommandOutput::ok(format!("Revocation was successful for {name}")))
        }
        "gen-crl" => {
            let index = fs::read_to_string(pki.join("index.txt"))?;
            let revoked: Vec<&str> = index
                .lines()
                .filter_map(|l| l.strip_prefix("R\t"))
                .collect();
            write(&pki.join("crl.pem"), &pem("X509 CRL", &revoked.join("\n")))?;
            Ok(CommandOutput::ok("CRL generated"))
        }
        other => Ok(CommandOutput::failed(format!("Unknown command '{other}'"))),
    }
}

fn append_index(pki: &Path, line: &str) -> Result<()> {
    let path = pki.join("index.txt");
    let mut index = fs::read_to_string(&path).unwrap_or_default();
    index.push_str(line);
    fs::write(path, index)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn easyrsa(pki: &Path, args: &[&str]) -> CommandSpec {
        CommandSpec::new("/usr/share/easy-rsa/easyrsa", Duration::from_secs(5))
            .args(args.iter().copied())
            .env("EASYRSA_PKI", pki.display().to_string())
    }

    #[tokio::test]
    async fn test_easyrsa_issue_and_revoke() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pki = tmp.path().join("pki");
        let runner = FakeRunner::new();

        let out = runner.execute(&easyrsa(&pki, &["build-ca", "nopass"])).await.unwrap();
        assert!(!out.success, "build-ca before init-pki must fail");

        runner.run_checked(&easyrsa(&pki, &["init-pki"])).await.unwrap();
        runner.run_checked(&easyrsa(&pki, &["build-ca", "nopass"])).await.unwrap();
        runner
            .run_checked(&easyrsa(&pki, &["build-client-full", "site-a", "nopass"]))
            .await
            .unwrap();
        assert!(pki.join("issued/site-a.crt").exists());

        let dup = runner
            .execute(&easyrsa(&pki, &["build-client-full", "site-a", "nopass"]))
            .await
            .unwrap();
        assert!(!dup.success);

        runner.run_checked(&easyrsa(&pki, &["revoke", "site-a"])).await.unwrap();
        runner.run_checked(&easyrsa(&pki, &["gen-crl"])).await.unwrap();
        assert!(!pki.join("issued/site-a.crt").exists());
        assert!(fs::read_to_string(pki.join("crl.pem")).unwrap().contains("site-a"));
        assert_eq!(runner.count("build-client-full"), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let runner = FakeRunner::new();
        runner.fail_on("genkey", FakeFailure::Timeout);
        let spec = CommandSpec::new("wg", Duration::from_secs(30)).arg("genkey");
        assert!(matches!(
            runner.execute(&spec).await.unwrap_err(),
            Error::Timeout { seconds: 30, .. }
        ));

        runner.clear_failures();
        let out = runner.run_checked(&spec).await.unwrap();
        assert!(out.stdout.starts_with("private-"));
    }
}
