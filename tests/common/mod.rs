#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

/// Write an executable shell script into `dir` and return its path. Used as
/// a stand-in for the real encoder binary so the tests control exactly how
/// the "encoder" behaves.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Fake encoder that behaves like ffmpeg's HLS muxer from the outside: it
/// derives the rendition directory from its final argument (the playlist
/// path), writes a playlist and one segment there, then consumes stdin until
/// the pipe closes.
#[cfg(unix)]
pub fn segment_writing_encoder(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "fake-ffmpeg",
        r#"for arg in "$@"; do out="$arg"; done
outdir=$(dirname "$out")
mkdir -p "$outdir"
printf '#EXTM3U\n#EXT-X-TARGETDURATION:2\nsegment_00000.ts\n' > "$out"
: > "$outdir/segment_00000.ts"
cat > /dev/null"#,
    )
}

/// Fake encoder that exits immediately, as a crashed encoder would.
#[cfg(unix)]
pub fn instantly_exiting_encoder(dir: &Path) -> PathBuf {
    write_script(dir, "fake-ffmpeg-dead", "exit 3")
}
