use anyhow::{Context, Result};
use clap::Args;
use mqtt3::broker::PasswordAuthProvider;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Args, Debug)]
pub struct PasswdCommand {
    /// Create a new password file, overwriting any existing one
    #[arg(short = 'c')]
    pub create: bool,

    /// Take the password from the command line instead of stdin
    #[arg(short = 'b', value_name = "PASSWORD")]
    pub password: Option<String>,

    /// User to add or update
    pub username: String,

    /// Password file to update
    pub file: PathBuf,
}

pub async fn execute(cmd: &PasswdCommand) -> Result<()> {
    if cmd.username.is_empty() || cmd.username.contains(':') {
        anyhow::bail!("Username must be non-empty and must not contain ':'");
    }

    let password = match &cmd.password {
        Some(password) => password.clone(),
        None => read_password(&cmd.username).await?,
    };
    if password.is_empty() {
        anyhow::bail!("Password must not be empty");
    }

    let hash = PasswordAuthProvider::hash_password(&password).context("Failed to hash password")?;

    let existing = if cmd.create {
        String::new()
    } else {
        read_existing(&cmd.file).await?
    };

    let (content, replaced) = upsert_entry(&existing, &cmd.username, &hash);
    tokio::fs::write(&cmd.file, content)
        .await
        .with_context(|| format!("Failed to write {}", cmd.file.display()))?;

    if replaced {
        println!("Updated password for user {}", cmd.username);
    } else {
        println!("Added user {}", cmd.username);
    }
    Ok(())
}

async fn read_existing(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            anyhow::bail!("{} does not exist, use -c to create it", path.display())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

async fn read_password(username: &str) -> Result<String> {
    let mut stderr = tokio::io::stderr();
    stderr
        .write_all(format!("Password for {username}: ").as_bytes())
        .await?;
    stderr.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Replaces the line for `username`, or appends one. Other lines are kept
/// as they are.
fn upsert_entry(content: &str, username: &str, hash: &str) -> (String, bool) {
    let entry = format!("{username}:{hash}");
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| match line.split_once(':') {
            Some((user, _)) if user.trim() == username && !replaced => {
                replaced = true;
                entry.clone()
            }
            _ => line.to_string(),
        })
        .collect();
    if !replaced {
        lines.push(entry);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    (out, replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt3::broker::auth::parse_password_file;

    #[test]
    fn test_upsert_appends_new_user() {
        let (content, replaced) = upsert_entry("# users\nalice:hash1\n", "bob", "hash2");
        assert!(!replaced);
        assert_eq!(content, "# users\nalice:hash1\nbob:hash2\n");
    }

    #[test]
    fn test_upsert_replaces_existing_user() {
        let (content, replaced) = upsert_entry("alice:old\nbob:keep\n", "alice", "new");
        assert!(replaced);
        assert_eq!(content, "alice:new\nbob:keep\n");
    }

    #[test]
    fn test_upsert_into_empty_file() {
        let (content, replaced) = upsert_entry("", "alice", "h");
        assert!(!replaced);
        assert_eq!(content, "alice:h\n");
    }

    #[tokio::test]
    async fn test_create_then_add_users() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("passwd");

        let create = PasswdCommand {
            create: true,
            password: Some("pass1".to_string()),
            username: "alice".to_string(),
            file: file.clone(),
        };
        execute(&create).await.unwrap();

        let add = PasswdCommand {
            create: false,
            password: Some("pass2".to_string()),
            username: "bob".to_string(),
            file: file.clone(),
        };
        execute(&add).await.unwrap();

        let users = parse_password_file(&std::fs::read_to_string(&file).unwrap());
        assert_eq!(users.len(), 2);
        assert!(PasswordAuthProvider::verify_password(b"pass1", &users["alice"]).unwrap());
        assert!(PasswordAuthProvider::verify_password(b"pass2", &users["bob"]).unwrap());
        assert!(!PasswordAuthProvider::verify_password(b"pass1", &users["bob"]).unwrap());
    }

    #[tokio::test]
    async fn test_update_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = PasswdCommand {
            create: false,
            password: Some("secret".to_string()),
            username: "alice".to_string(),
            file: dir.path().join("missing"),
        };
        assert!(execute(&cmd).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_colon_in_username() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = PasswdCommand {
            create: true,
            password: Some("secret".to_string()),
            username: "a:b".to_string(),
            file: dir.path().join("passwd"),
        };
        assert!(execute(&cmd).await.is_err());
    }
}
