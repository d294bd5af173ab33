use skiff_types::FileInfo;

const SECRET_MARKERS: [&str; 4] = ["KEY", "TOKEN", "SECRET", "PASSWORD"];

/// Parses `find -printf '%y|%s|%p\n'` output. The listed directory itself is
/// skipped; sizes are reported for non-directories only.
pub fn parse_listing(dir: &str, stdout: &str) -> Vec<FileInfo> {
    let dir = if dir.len() > 1 {
        dir.trim_end_matches('/')
    } else {
        dir
    };
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '|');
            let kind = fields.next()?;
            let size = fields.next()?;
            let path = fields.next()?;
            if path.is_empty() || path.trim_end_matches('/') == dir || path == dir {
                return None;
            }
            let is_directory = kind == "d";
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            Some(FileInfo {
                name,
                path: path.to_string(),
                is_directory,
                size: if is_directory {
                    None
                } else {
                    size.parse().ok()
                },
            })
        })
        .collect()
}

/// Drops `NAME=value` lines whose name looks secret-bearing.
pub fn redact_environment(raw: &str) -> String {
    raw.lines()
        .filter(|line| {
            let name = line.split('=').next().unwrap_or("").to_ascii_uppercase();
            !SECRET_MARKERS.iter().any(|marker| name.contains(marker))
        })
        .map(|line| format!("{}\n", line))
        .collect()
}
