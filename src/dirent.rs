// SPDX-License-Identifier: BSD-3-Clause

//! Directory entry line formatting for LIST/NLST/MLSD/MLST/STAT, grounded in
//! `FtpSession::fillDirent`.

use std::fs::Metadata;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

/// Which listing command a directory entry is being formatted for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum XferDirMode {
    List,
    Nlst,
    Mlsd,
    Mlst,
    Stat,
}

/// Which MLSx facts are enabled, toggled by `OPTS MLST`.
#[derive(Clone, Copy, Debug)]
pub struct MlstFacts {
    pub type_: bool,
    pub size: bool,
    pub modify: bool,
    pub perm: bool,
    pub unix_mode: bool,
}

impl Default for MlstFacts {
    fn default() -> Self {
        Self {
            type_: true,
            size: true,
            modify: true,
            perm: true,
            unix_mode: true,
        }
    }
}

fn type_fact(meta: &Metadata) -> &'static str {
    let ft = meta.file_type();
    if ft.is_file() {
        "file"
    } else if ft.is_dir() {
        "dir"
    } else if ft.is_symlink() {
        "os.unix=symlink"
    } else if ft.is_char_device() {
        "os.unix=character"
    } else if ft.is_block_device() {
        "os.unix=block"
    } else if ft.is_fifo() {
        "os.unix=fifo"
    } else if ft.is_socket() {
        "os.unix=socket"
    } else {
        "???"
    }
}

fn perm_fact(meta: &Metadata) -> String {
    let mode = meta.mode();
    let is_reg = meta.is_file();
    let is_dir = meta.is_dir();
    let wr = mode & libc::S_IWUSR as u32 != 0;
    let rd = mode & libc::S_IRUSR as u32 != 0;
    let ex = mode & libc::S_IXUSR as u32 != 0;

    let mut perm = String::new();
    if is_reg && wr {
        perm.push('a');
    }
    if is_dir && wr {
        perm.push('c');
    }
    perm.push('d');
    if is_dir && ex {
        perm.push('e');
    }
    perm.push('f');
    if is_dir && rd {
        perm.push('l');
    }
    if is_dir && wr {
        perm.push('m');
    }
    if is_dir && wr {
        perm.push('p');
    }
    if is_reg && rd {
        perm.push('r');
    }
    if is_reg && wr {
        perm.push('w');
    }
    perm
}

fn mtime(meta: &Metadata) -> DateTime<Utc> {
    DateTime::<Utc>::from(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH))
}

/// Format one entry's listing line (without the trailing `\r\n`, which the
/// caller appends once it has confirmed the line fits the transfer buffer).
pub fn format_entry(
    mode: XferDirMode,
    facts: &MlstFacts,
    meta: &Metadata,
    path: &str,
    now: SystemTime,
) -> String {
    let mut out = String::new();

    match mode {
        XferDirMode::Mlsd | XferDirMode::Mlst => {
            if mode == XferDirMode::Mlst {
                out.push(' ');
            }
            if facts.type_ {
                out.push_str(&format!("Type={};", type_fact(meta)));
            }
            if facts.size {
                out.push_str(&format!("Size={};", meta.size()));
            }
            if facts.modify {
                out.push_str(&format!("Modify={};", mtime(meta).format("%Y%m%d%H%M%S")));
            }
            if facts.perm {
                out.push_str(&format!("Perm={};", perm_fact(meta)));
            }
            if facts.unix_mode {
                let mask = (libc::S_IRWXU
                    | libc::S_IRWXG
                    | libc::S_IRWXO
                    | libc::S_ISVTX
                    | libc::S_ISGID
                    | libc::S_ISUID) as u32;
                out.push_str(&format!("UNIX.mode=0{:o};", meta.mode() & mask));
            }
            if !out.ends_with(' ') {
                out.push(' ');
            }
        }
        XferDirMode::Nlst => {}
        XferDirMode::List | XferDirMode::Stat => {
            if mode == XferDirMode::Stat {
                out.push(' ');
            }

            let type_char = if meta.is_file() {
                '-'
            } else if meta.is_dir() {
                'd'
            } else {
                let ft = meta.file_type();
                if ft.is_symlink() {
                    'l'
                } else if ft.is_char_device() {
                    'c'
                } else if ft.is_block_device() {
                    'b'
                } else if ft.is_fifo() {
                    'p'
                } else if ft.is_socket() {
                    's'
                } else {
                    '?'
                }
            };

            let m = meta.mode();
            let bit = |flag: u32, c: char| if m & flag != 0 { c } else { '-' };
            let perms: String = [
                bit(libc::S_IRUSR as u32, 'r'),
                bit(libc::S_IWUSR as u32, 'w'),
                bit(libc::S_IXUSR as u32, 'x'),
                bit(libc::S_IRGRP as u32, 'r'),
                bit(libc::S_IWGRP as u32, 'w'),
                bit(libc::S_IXGRP as u32, 'x'),
                bit(libc::S_IROTH as u32, 'r'),
                bit(libc::S_IWOTH as u32, 'w'),
                bit(libc::S_IXOTH as u32, 'x'),
            ]
            .into_iter()
            .collect();

            out.push_str(&format!(
                "{}{} {} {} {} {} ",
                type_char,
                perms,
                meta.nlink(),
                meta.uid(),
                meta.gid(),
                meta.size()
            ));

            let mtime = mtime(meta);
            let now: DateTime<Utc> = DateTime::<Utc>::from(now);
            let half_year = chrono::Duration::days(365 / 2);
            if now > mtime && now - mtime < half_year {
                out.push_str(&mtime.format("%b %e %H:%M ").to_string());
            } else {
                out.push_str(&mtime.format("%b %e %Y ").to_string());
            }
        }
    }

    out.push_str(path);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn mlsd_line_contains_all_default_facts() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        let line = format_entry(
            XferDirMode::Mlsd,
            &MlstFacts::default(),
            &meta,
            "a.txt",
            SystemTime::now(),
        );

        assert!(line.contains("Type=file;"));
        assert!(line.contains("Size=5;"));
        assert!(line.contains("Modify="));
        assert!(line.contains("Perm="));
        assert!(line.contains("UNIX.mode=0"));
        assert!(line.ends_with("a.txt"));
    }

    #[test]
    fn mlst_prefixes_a_leading_space() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        let line = format_entry(
            XferDirMode::Mlst,
            &MlstFacts::default(),
            &meta,
            "a.txt",
            SystemTime::now(),
        );
        assert!(line.starts_with(' '));
    }

    #[test]
    fn nlst_is_bare_path() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        let line = format_entry(
            XferDirMode::Nlst,
            &MlstFacts::default(),
            &meta,
            "/cwd/a.txt",
            SystemTime::now(),
        );
        assert_eq!(line, "/cwd/a.txt");
    }

    #[test]
    fn list_line_uses_recent_time_format_for_fresh_files() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();
        let meta = std::fs::metadata(&file).unwrap();

        let line = format_entry(
            XferDirMode::List,
            &MlstFacts::default(),
            &meta,
            "a.txt",
            SystemTime::now() + Duration::from_secs(60),
        );
        assert!(line.starts_with('-'));
        assert!(line.ends_with("a.txt"));
    }

    #[test]
    fn perm_fact_marks_directories_listable_and_creatable() {
        let dir = tempdir().unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        let perm = perm_fact(&meta);
        assert!(perm.contains('d'));
        assert!(perm.contains('f'));
    }
}
