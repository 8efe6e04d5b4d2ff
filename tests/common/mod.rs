#![allow(dead_code)]

use std::path::{Path, PathBuf};

/// Stand-in for `docker`. Logs every call to `calls.log` next to itself and
/// acts on the bound working directory (the first `-v`) the way the OCR-D
/// image would. The image `hang` makes `ocrd process` touch `hanging` and
/// sleep for three seconds first.
pub const FAKE_RUNTIME: &str = r#"#!/bin/sh
here=$(dirname "$0")
echo "$*" >> "$here/calls.log"
[ "$1" = kill ] && exit 0
host=""
image=""
while [ $# -gt 0 ]; do
  case "$1" in
    -v) [ -z "$host" ] && host="${2%%:*}"; shift 2 ;;
    -w|-u|--name|--memory|--memory-swap) shift 2 ;;
    ocrd) shift; break ;;
    *) image="$1"; shift ;;
  esac
done
case "$1 $2" in
  "workspace init") touch "$host/mets.xml" ;;
  "workspace add") [ -f "$host/mets.xml" ] || { echo "no workspace" >&2; exit 1; } ;;
  process*)
    if [ "$image" = hang ]; then
      touch "$here/hanging"
      sleep 3
    fi
    mkdir -p "$host/FULLTEXT"
    printf '<alto><TextLine><String CONTENT="Seite"/></TextLine></alto>' > "$host/FULLTEXT/FULLTEXT_0001.xml"
    ;;
esac
"#;

#[cfg(unix)]
pub fn install_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Lines of `calls.log` written by [`FAKE_RUNTIME`] installed in `dir`.
pub fn runtime_calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(String::from)
        .collect()
}
