//! Deterministic fake outputs for the command-line tools an attacker
//! would reach for. The values are derived from a hash of the target so
//! repeated runs produce identical artifacts; nothing is ever executed.

use sha2::{Digest, Sha256};

const POD_NAMES: &[&str] = &[
    "api-server-7d8f9c4b",
    "worker-5c3a1e8d",
    "redis-cache-9f2b4a",
    "postgres-db-3e7c1f",
    "nginx-proxy-6a9d2b",
];

/// Render a plausible tool transcript for the diagnostic report.
#[must_use]
pub fn mock_output(target: &str) -> String {
    let lowered = target.to_lowercase();
    if lowered.contains("kubectl") {
        mock_kubectl(target)
    } else if lowered.contains("aws") {
        mock_aws(target)
    } else if lowered.contains("ssh") || lowered.contains("exec") {
        mock_ssh(target)
    } else if lowered.contains("curl") {
        mock_curl(target)
    } else {
        mock_generic(target)
    }
}

fn seed(target: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(target.as_bytes());
    hasher.finalize().to_vec()
}

fn pick<'a>(options: &[&'a str], seed_byte: u8) -> &'a str {
    options[usize::from(seed_byte) % options.len()]
}

fn mock_kubectl(target: &str) -> String {
    let digest = seed(target);
    let mut lines = vec![
        "$ kubectl get pods -n production".to_string(),
        "NAME              READY   STATUS    RESTARTS   AGE".to_string(),
    ];
    for (slot, pod) in POD_NAMES.iter().take(3).enumerate() {
        let age_days = 1 + usize::from(digest[slot]) % 30;
        lines.push(format!("{pod:<18}1/1     Running   0          {age_days}d"));
    }
    lines.join("\n")
}

fn mock_aws(target: &str) -> String {
    let digest = seed(target);
    let region = pick(&["us-east-1", "us-west-2", "eu-central-1"], digest[0]);
    format!(
        "$ aws sts get-caller-identity\n{{\n  \"UserId\": \"AIDA{}\",\n  \"Account\": \"{:012}\",\n  \"Region\": \"{region}\"\n}}",
        hex::encode(&digest[..6]).to_uppercase(),
        u64::from(digest[1]) * 7_654_321,
    )
}

fn mock_ssh(target: &str) -> String {
    let digest = seed(target);
    let host = pick(POD_NAMES, digest[2]);
    format!(
        "$ ssh ops@{host}\nLast login: from 10.0.{}.{}\nops@{host}:~$ whoami\nops",
        digest[3] % 255,
        digest[4] % 255,
    )
}

fn mock_curl(target: &str) -> String {
    let digest = seed(target);
    format!(
        "$ curl -s https://internal.health/status\n{{\"status\": \"ok\", \"build\": \"{}\"}}",
        hex::encode(&digest[..4]),
    )
}

fn mock_generic(target: &str) -> String {
    format!("$ diagnose {target}\nwhoami: demo_user\nhostname: demo-host\nchecks: passed")
}
