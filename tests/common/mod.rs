// Shared fixtures: a shell-script stand-in for tenzir-ctl and Suricata data.
#![allow(dead_code)]

use arrow::array::{ArrayRef, FixedSizeBinaryArray, StringArray, TimestampNanosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const SURICATA_SCHEMAS: [&str; 8] = [
    "suricata.alert",
    "suricata.dns",
    "suricata.fileinfo",
    "suricata.flow",
    "suricata.http",
    "suricata.netflow",
    "suricata.smtp",
    "suricata.tls",
];

pub const SRC_IP: &str = "147.32.84.165";
pub const DEST_IP: &str = "78.40.125.4";

/// Parses `--endpoint=...`, records the remaining arguments in `$DIR/args`,
/// and leaves the subcommand in `$cmd`.
const PRELUDE: &str = r#"endpoint=''
case "$1" in
  --endpoint=*) endpoint="${1#--endpoint=}"; shift ;;
esac
printf '%s\n' "$@" > "$DIR/args"
cmd="$1"
[ $# -gt 0 ] && shift
"#;

/// Serves `status`, `count`, and `export` from files in `$DIR`.
pub const STANDARD_ENGINE: &str = r#"case "$cmd" in
  status)
    printf '{"version":"v4.0.0","endpoint":"%s"}\n' "$endpoint"
    ;;
  count)
    cat "$DIR/count.txt"
    ;;
  export)
    encoding=json
    while [ $# -gt 0 ]; do
      case "$1" in
        --*) shift ;;
        json|arrow) encoding="$1"; shift; break ;;
        *) break ;;
      esac
    done
    if [ "$encoding" = arrow ]; then
      cat "$DIR/export.arrow"
    else
      cat "$DIR/export.jsonl"
    fi
    ;;
  *)
    echo "unknown command: $cmd" >&2
    exit 1
    ;;
esac
"#;

pub struct FakeEngine {
    dir: TempDir,
    program: PathBuf,
}

impl FakeEngine {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let program = dir.path().join("tenzir-ctl");
        let script = format!(
            "#!/bin/sh\nDIR='{}'\n{PRELUDE}{body}",
            dir.path().display()
        );
        std::fs::write(&program, script).expect("write script");
        let mut perms = std::fs::metadata(&program).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&program, perms).expect("chmod");
        Self { dir, program }
    }

    pub fn standard() -> Self {
        Self::new(STANDARD_ENGINE)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) {
        std::fs::write(self.dir.path().join(name), contents).expect("write fixture");
    }

    /// Arguments of the last invocation after `--endpoint`.
    pub fn last_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("args"))
            .expect("args")
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Waits until the script has stored its pid in `$DIR/pid`.
    pub fn wait_for_pid(&self) -> i32 {
        let path = self.dir.path().join("pid");
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("engine never wrote its pid");
    }
}

pub fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

pub async fn wait_until_gone(pid: i32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !process_alive(pid)
}

fn ip_field(name: &str) -> Field {
    Field::new(name, DataType::FixedSizeBinary(16), true).with_metadata(HashMap::from([(
        "ARROW:extension:name".to_string(),
        "tenzir.ip".to_string(),
    )]))
}

fn ip_column(addr: &str) -> ArrayRef {
    let v4: Ipv4Addr = addr.parse().expect("ipv4");
    let octets = v4.to_ipv6_mapped().octets();
    Arc::new(FixedSizeBinaryArray::try_from_iter(std::iter::once(octets)).expect("ip column"))
}

/// One event of `schema`, shaped like a Suricata EVE record.
pub fn suricata_batch(schema: &str) -> RecordBatch {
    let event_type = schema.trim_start_matches("suricata.");
    let fields = vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Nanosecond, None),
            true,
        ),
        Field::new("event_type", DataType::Utf8, true),
        ip_field("src_ip"),
        ip_field("dest_ip"),
    ];
    let metadata = HashMap::from([("TENZIR:name:0".to_string(), schema.to_string())]);
    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampNanosecondArray::from(vec![1_325_376_000_000_000_000i64])),
        Arc::new(StringArray::from(vec![event_type])),
        ip_column(SRC_IP),
        ip_column(DEST_IP),
    ];
    RecordBatch::try_new(Arc::new(Schema::new(fields).with_metadata(metadata)), columns)
        .expect("suricata batch")
}

/// Concatenated IPC streams, one per batch, the way the engine emits them.
pub fn arrow_export(schemas: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for schema in schemas {
        let batch = suricata_batch(schema);
        let mut writer = StreamWriter::try_new(&mut out, batch.schema_ref()).expect("writer");
        writer.write(&batch).expect("write batch");
        writer.finish().expect("finish stream");
    }
    out
}

pub fn jsonl_export(schemas: &[&str]) -> String {
    schemas
        .iter()
        .map(|schema| {
            format!(
                "{{\"timestamp\":\"2012-01-01T00:00:00Z\",\"event_type\":\"{}\",\"src_ip\":\"{SRC_IP}\",\"dest_ip\":\"{DEST_IP}\"}}\n",
                schema.trim_start_matches("suricata.")
            )
        })
        .collect()
}

/// A standard engine loaded with the full Suricata fixture set.
pub fn suricata_engine() -> FakeEngine {
    let engine = FakeEngine::standard();
    engine.write("count.txt", format!("{}\n", SURICATA_SCHEMAS.len()));
    engine.write("export.jsonl", jsonl_export(&SURICATA_SCHEMAS));
    engine.write("export.arrow", arrow_export(&SURICATA_SCHEMAS));
    engine
}

/// Emits one record, stores its pid, then blocks like a continuous export.
pub const CONTINUOUS_ENGINE: &str = r#"case "$cmd" in
  status) echo '{}' ;;
  export)
    printf '{"n":1}\n'
    echo $$ > "$DIR/pid"
    exec sleep 30
    ;;
esac
"#;
