//! Shared test fixtures for fv integration tests.
//!
//! [`FakeDataplane`] writes two shell scripts into a temporary directory:
//!
//! - **agent**: behaves like a BPF dataplane agent at startup. For every
//!   interface matching `FELIX_BPFDataIfacePattern` it attaches a "to" and
//!   a "from" program, or reports that one is already attached. Programs on
//!   non-matching interfaces are removed. It then prints `startup complete`
//!   and idles until SIGTERM.
//! - **bpftool**: `bpftool -jp net` style JSON listing of the programs the
//!   agent attached.
//!
//! Attach state is kept per node under `<state>/<FV_NODE_NAME>/` and
//! survives agent restarts, like programs left in the kernel.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Printed by the fake agent once its attach pass is done.
pub const STARTUP_COMPLETE: &str = "startup complete";

const AGENT: &str = r##"#!/bin/sh
state="@STATE@/${FV_NODE_NAME:-default}"
mkdir -p "$state"
pattern="${FELIX_BPFDataIfacePattern:-^(eth|wlan).*}"
trap 'echo "received SIGTERM, shutting down"; exit 0' TERM
echo "agent starting node=${FV_NODE_NAME:-default} severity=${FELIX_LOGSEVERITYSCREEN:-info}"
for iface in eth0 eth1; do
  if echo "$iface" | grep -Eq "$pattern"; then
    for dir in to from; do
      if [ -e "$state/$iface.$dir" ]; then
        echo "Program already attached to TC, skip reattaching ${dir}_hep_fib_debug.o iface=$iface"
      else
        echo "Continue with attaching BPF program ${dir}_hep_fib_debug.o iface=$iface"
        : > "$state/$iface.$dir"
        echo "Program attached to TC. attachPoint=&{Iface:$iface Type:\"host\", ToOrFrom:\"$dir\"}"
      fi
    done
  else
    rm -f "$state/$iface.to" "$state/$iface.from"
    echo "Removed programs from interface not matching pattern iface=$iface"
  fi
done
echo "startup complete"
while :; do
  sleep 0.1
done
"##;

const BPFTOOL: &str = r##"#!/bin/sh
state="@STATE@/${FV_NODE_NAME:-default}"
printf '[{"xdp":[],"tc":['
sep=""
for f in "$state"/*.to "$state"/*.from; do
  [ -e "$f" ] || continue
  base=$(basename "$f")
  printf '%s{"devname":"%s","kind":"tc","name":"%s_hep_fib_debug"}' "$sep" "${base%.*}" "${base##*.}"
  sep=","
done
printf '],"flow_dissector":[]}]\n'
"##;

/// A scripted agent and inspection tool sharing one state directory.
pub struct FakeDataplane {
    dir: TempDir,
    agent: PathBuf,
    bpftool: PathBuf,
}

impl FakeDataplane {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create fake dataplane dir");
        let state = dir.path().join("state");
        fs::create_dir_all(&state).expect("failed to create state dir");

        let state = state.display().to_string();
        let agent = write_script(dir.path(), "agent", &AGENT.replace("@STATE@", &state));
        let bpftool = write_script(dir.path(), "bpftool", &BPFTOOL.replace("@STATE@", &state));
        Self {
            dir,
            agent,
            bpftool,
        }
    }

    /// Path to the fake agent.
    pub fn agent(&self) -> &Path {
        &self.agent
    }

    /// Path to the fake inspection tool.
    pub fn bpftool(&self) -> &Path {
        &self.bpftool
    }

    /// Root of the per-node attach state.
    pub fn state_dir(&self) -> PathBuf {
        self.dir.path().join("state")
    }

    /// Program markers for `node`, e.g. `["eth0.from", "eth0.to"]`, sorted.
    pub fn attached(&self, node: &str) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.state_dir().join(node)) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

impl Default for FakeDataplane {
    fn default() -> Self {
        Self::new()
    }
}

/// Write an executable script `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("failed to write script");
    let mut perms = fs::metadata(&path).expect("failed to stat script").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to chmod script");
    path
}
