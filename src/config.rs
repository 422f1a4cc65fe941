//! Live configuration from a watched text file
//!
//! The config file is line-oriented: `host1 host2 -> target1 target2`
//! registers the Cartesian product of hostnames and targets. Before parsing,
//! the file is expanded as a text template with string/date/environment
//! helpers. The watcher coalesces bursts of filesystem events with a one
//! second debounce, diffs the parsed entries against the previous set and
//! emits one batch of up/down events per reload, ups first.

use anyhow::Context;
use minijinja::Environment;
use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

/// Sample config written when the configured file does not exist
pub const EXAMPLE_CONFIG: &str = "\
# razvhost demo config
#
# hostnames on the left, targets on the right:
#   host1 host2 -> target1 target2
#
# recognized target schemes: file, http, https, redirect, s3, sftp, php,
# go-wasm, tail, tail-new

example.com www.example.com -> http://localhost:8080
example.com/files -> file:///var/www/public/
";

/// Debounce window for bursts of file events
const RELOAD_DEBOUNCE: Duration = Duration::from_secs(1);

/// A single route declaration
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    /// `host[/path-prefix]`
    pub hostname: String,
    /// backend target; the scheme selects the handler kind
    pub target: Url,
}

impl ConfigEntry {
    /// Entries compare by exact hostname and serialized target
    pub fn same_as(&self, other: &ConfigEntry) -> bool {
        self.hostname == other.hostname && self.target.as_str() == other.target.as_str()
    }
}

/// A route going up or down
#[derive(Debug, Clone)]
pub struct ConfigEvent {
    pub entry: ConfigEntry,
    pub up: bool,
}

impl fmt::Display for ConfigEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} [{}]",
            self.entry.hostname,
            self.entry.target,
            if self.up { "UP" } else { "DOWN" }
        )
    }
}

/// Expand the config text as a template before parsing.
///
/// Expansion failures fail the whole parse; per-line errors later only skip
/// the line.
fn expand_templates(input: &str) -> anyhow::Result<String> {
    let mut env = Environment::new();
    env.add_function("env", |name: String| {
        std::env::var(&name).unwrap_or_default()
    });
    env.add_function("now", |format: Option<String>| {
        chrono::Utc::now()
            .format(format.as_deref().unwrap_or("%Y-%m-%d %H:%M:%S"))
            .to_string()
    });
    env.render_str(input, minijinja::context! {})
        .context("config template expansion failed")
}

/// Parse config text into route entries
pub fn parse_config(text: &str) -> anyhow::Result<Vec<ConfigEntry>> {
    let rendered = expand_templates(text)?;

    let mut entries = Vec::new();
    for line in rendered.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((lhs, rhs)) = line.split_once("->") else {
            warn!(line, "bad config line");
            continue;
        };
        let hostnames: Vec<&str> = lhs.split_whitespace().collect();
        let mut targets = Vec::new();
        for raw in rhs.split_whitespace() {
            match Url::parse(raw) {
                Ok(url) => targets.push(url),
                Err(e) => warn!(target = raw, error = %e, "bad target url"),
            }
        }
        if hostnames.is_empty() || targets.is_empty() {
            warn!(line, "bad config line");
            continue;
        }
        for hostname in &hostnames {
            for target in &targets {
                entries.push(ConfigEntry {
                    hostname: hostname.to_string(),
                    target: target.clone(),
                });
            }
        }
    }
    Ok(entries)
}

/// Read and parse a config file
pub fn read_config_file(path: &Path) -> anyhow::Result<Vec<ConfigEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&text)
}

/// Set difference of entries: `up = new − prev`, `down = prev − new`
pub fn diff_entries(
    prev: &[ConfigEntry],
    new: &[ConfigEntry],
) -> (Vec<ConfigEntry>, Vec<ConfigEntry>) {
    let up = new
        .iter()
        .filter(|n| !prev.iter().any(|p| p.same_as(n)))
        .cloned()
        .collect();
    let down = prev
        .iter()
        .filter(|p| !new.iter().any(|n| n.same_as(p)))
        .cloned()
        .collect();
    (up, down)
}

fn to_events(entries: Vec<ConfigEntry>, up: bool) -> Vec<ConfigEvent> {
    entries
        .into_iter()
        .map(|entry| ConfigEvent { entry, up })
        .collect()
}

/// Watched config file emitting route-delta batches
pub struct ConfigFile {
    path: PathBuf,
    prev: Mutex<Vec<ConfigEntry>>,
    generation: AtomicU32,
    tx: mpsc::Sender<Vec<ConfigEvent>>,
}

impl ConfigFile {
    /// Open (or create with [`EXAMPLE_CONFIG`]) the config file.
    ///
    /// The initial entry set is parsed immediately; call
    /// [`initial_events`](Self::initial_events) to seed the consumer.
    pub fn open(path: impl Into<PathBuf>, tx: mpsc::Sender<Vec<ConfigEvent>>) -> anyhow::Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            read_config_file(&path)?
        } else {
            std::fs::write(&path, EXAMPLE_CONFIG)
                .with_context(|| format!("failed to create demo config {}", path.display()))?;
            info!(path = %path.display(), "created demo config");
            Vec::new()
        };
        Ok(Self {
            path,
            prev: Mutex::new(entries),
            generation: AtomicU32::new(0),
            tx,
        })
    }

    /// Up events for the entries present at startup
    pub fn initial_events(&self) -> Vec<ConfigEvent> {
        to_events(self.prev.lock().clone(), true)
    }

    /// Watch the file for edits until the event channel closes.
    ///
    /// Editors often write-then-rename, which can both drop the watch and
    /// fire several events back to back; the watch is re-armed after every
    /// event and reloads are debounced.
    pub async fn watch(self: Arc<Self>) -> anyhow::Result<()> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<()>(8);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) if is_relevant_event(&event) => {
                    let _ = raw_tx.blocking_send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "config file watch error"),
            })?;
        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", self.path.display()))?;

        while raw_rx.recv().await.is_some() {
            let _ = watcher.watch(&self.path, RecursiveMode::NonRecursive);
            let cfg = Arc::clone(&self);
            tokio::spawn(async move { cfg.debounced_reload().await });
        }
        Ok(())
    }

    /// Coalesce event bursts: only the task whose generation is still
    /// current after the debounce window performs the reload.
    async fn debounced_reload(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(RELOAD_DEBOUNCE).await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        self.reload().await;
    }

    async fn reload(&self) {
        let new = match read_config_file(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to read config file, keeping previous entries");
                return;
            }
        };

        let batch = {
            let mut prev = self.prev.lock();
            let (up, down) = diff_entries(&prev, &new);
            *prev = new;
            let mut batch = to_events(up, true);
            batch.extend(to_events(down, false));
            batch
        };

        if batch.is_empty() {
            return;
        }
        info!(changes = batch.len(), "config updated");
        let _ = self.tx.send(batch).await;
    }
}

fn is_relevant_event(event: &notify::Event) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_) | notify::EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hostname: &str, target: &str) -> ConfigEntry {
        ConfigEntry {
            hostname: hostname.to_string(),
            target: Url::parse(target).unwrap(),
        }
    }

    #[test]
    fn test_parse_basic_lines() {
        let entries = parse_config(
            "# comment\n\
             \n\
             example.com -> http://localhost:8080\n\
             files.com -> file:///var/www/\n",
        )
        .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].hostname, "example.com");
        // the url crate normalizes http URLs to carry a path
        assert_eq!(entries[0].target.as_str(), "http://localhost:8080/");
        assert_eq!(entries[1].target.scheme(), "file");
    }

    #[test]
    fn test_parse_cartesian_product() {
        let entries =
            parse_config("a.com b.com -> http://x:1 http://y:2\n").unwrap();
        let pairs: Vec<(String, String)> = entries
            .iter()
            .map(|e| (e.hostname.clone(), e.target.as_str().to_string()))
            .collect();
        assert_eq!(pairs.len(), 4);
        assert!(pairs.contains(&("a.com".into(), "http://x:1/".into())));
        assert!(pairs.contains(&("b.com".into(), "http://y:2/".into())));
        assert_eq!(entries[0].hostname, "a.com");
        assert_eq!(entries[3].hostname, "b.com");
    }

    #[test]
    fn test_parse_skips_bad_lines_and_targets() {
        let entries = parse_config(
            "no arrow here\n\
             ok.com -> http://localhost:1 ::not-a-url::\n\
             -> http://orphan\n",
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].hostname, "ok.com");
    }

    #[test]
    fn test_parse_hostname_with_subpath() {
        let entries = parse_config("example.com/files -> file:///srv\n").unwrap();
        assert_eq!(entries[0].hostname, "example.com/files");
    }

    #[test]
    fn test_template_env_function() {
        std::env::set_var("RAZVHOST_TEST_PORT", "9911");
        let entries =
            parse_config("app.test -> http://localhost:{{ env('RAZVHOST_TEST_PORT') }}\n")
                .unwrap();
        assert_eq!(entries[0].target.as_str(), "http://localhost:9911/");
    }

    #[test]
    fn test_template_error_fails_parse() {
        assert!(parse_config("{{ unclosed\n").is_err());
    }

    #[test]
    fn test_diff_entries() {
        let prev = vec![
            entry("a.com", "http://x:1"),
            entry("b.com", "http://y:2"),
        ];
        let new = vec![
            entry("b.com", "http://y:2"),
            entry("c.com", "http://z:3"),
        ];
        let (up, down) = diff_entries(&prev, &new);
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].hostname, "c.com");
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].hostname, "a.com");
    }

    #[test]
    fn test_diff_same_hostname_different_target() {
        let prev = vec![entry("a.com", "http://x:1")];
        let new = vec![entry("a.com", "http://x:2")];
        let (up, down) = diff_entries(&prev, &new);
        assert_eq!(up.len(), 1);
        assert_eq!(down.len(), 1);
    }

    #[test]
    fn test_event_display() {
        let event = ConfigEvent {
            entry: entry("a.com", "http://x:1"),
            up: true,
        };
        assert_eq!(event.to_string(), "a.com -> http://x:1/ [UP]");
        let event = ConfigEvent {
            entry: entry("a.com", "http://x:1"),
            up: false,
        };
        assert!(event.to_string().ends_with("[DOWN]"));
    }

    #[tokio::test]
    async fn test_open_creates_demo_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        let (tx, _rx) = mpsc::channel(4);

        let cfg = ConfigFile::open(&path, tx).unwrap();
        assert!(path.exists());
        assert!(cfg.initial_events().is_empty());
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("->"));
    }

    #[tokio::test]
    async fn test_open_existing_yields_initial_up_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "a.test -> http://127.0.0.1:9001\n").unwrap();
        let (tx, _rx) = mpsc::channel(4);

        let cfg = ConfigFile::open(&path, tx).unwrap();
        let events = cfg.initial_events();
        assert_eq!(events.len(), 1);
        assert!(events[0].up);
        assert_eq!(events[0].entry.hostname, "a.test");
    }

    #[tokio::test]
    async fn test_debounce_coalesces_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "a.test -> http://127.0.0.1:1\n").unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let cfg = Arc::new(ConfigFile::open(&path, tx).unwrap());
        std::fs::write(&path, "a.test -> http://127.0.0.1:2\n").unwrap();

        // a burst of triggers within the debounce window runs one reload
        for _ in 0..5 {
            let cfg = Arc::clone(&cfg);
            tokio::spawn(async move { cfg.debounced_reload().await });
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let batch = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("reload batch")
            .expect("channel open");
        // one batch with the up before the down
        assert_eq!(batch.len(), 2);
        assert!(batch[0].up);
        assert!(!batch[1].up);

        // and no second batch arrives
        let extra = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
        assert!(extra.is_err(), "expected a single coalesced reload");
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "a.test -> http://127.0.0.1:1\n").unwrap();
        let (tx, mut rx) = mpsc::channel(16);

        let cfg = Arc::new(ConfigFile::open(&path, tx).unwrap());
        // breaking the template fails the reload; previous entries survive
        std::fs::write(&path, "{{ broken\n").unwrap();
        cfg.reload().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(cfg.prev.lock().len(), 1);

        // fixing the file emits the delta against the kept state
        std::fs::write(&path, "a.test -> http://127.0.0.1:1\nb.test -> http://127.0.0.1:2\n")
            .unwrap();
        cfg.reload().await;
        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entry.hostname, "b.test");
    }
}
