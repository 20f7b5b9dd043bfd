use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const CONFIG_SOURCE: &str = "src/sync/config.rs";
const ROOT_CONFIG: &str = "CommsyncConfig";
const ENV_LITERAL: &str = "\"COMMSYNC_";

fn collect_rs_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_rs_files(&path, out)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("rs") {
            out.push(path);
        }
    }
    Ok(())
}

fn is_ident(raw: &str) -> bool {
    !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Named fields of every struct declared in `source`, as `(field, type)`.
fn struct_fields(source: &str) -> BTreeMap<String, Vec<(String, String)>> {
    let mut out = BTreeMap::new();
    let mut current: Option<(String, Vec<(String, String)>)> = None;
    for line in source.lines().map(str::trim) {
        let decl = line.strip_prefix("pub ").unwrap_or(line);
        if let Some(name) = decl.strip_prefix("struct ").and_then(|r| r.strip_suffix(" {")) {
            current = Some((name.trim().to_string(), Vec::new()));
            continue;
        }
        let Some((name, fields)) = current.as_mut() else {
            continue;
        };
        if line == "}" {
            out.insert(std::mem::take(name), std::mem::take(fields));
            current = None;
            continue;
        }
        if let Some((field, ty)) = decl.split_once(": ") {
            if is_ident(field) {
                fields.push((field.to_string(), ty.trim_end_matches(',').trim().to_string()));
            }
        }
    }
    out
}

/// `section.key` for every field of every section of the root config.
fn config_keys(source: &str) -> BTreeSet<String> {
    let structs = struct_fields(source);
    let mut keys = BTreeSet::new();
    for (section, ty) in structs.get(ROOT_CONFIG).into_iter().flatten() {
        for (key, _) in structs.get(ty).into_iter().flatten() {
            keys.insert(format!("{section}.{key}"));
        }
    }
    keys
}

/// `COMMSYNC_*` literals passed as the first argument of a call. With
/// `targets`, the `cfg.section.key` path named later in the same statement
/// is recorded as the config key the variable overrides.
fn collect_env_keys(source: &str, targets: bool, out: &mut BTreeMap<String, Option<String>>) {
    let mut offset = 0usize;
    while let Some(found) = source[offset..].find(ENV_LITERAL) {
        let at = offset + found;
        let tail = &source[at + 1..];
        let Some(end) = tail.find('"') else {
            break;
        };
        let key = &tail[..end];
        let rest = &tail[end + 1..];
        offset = at + 1 + end + 1;

        let is_argument = source[..at].trim_end().ends_with('(');
        if !is_argument || !is_ident(key) {
            continue;
        }
        let target = targets
            .then(|| rest.split(';').next().unwrap_or(""))
            .and_then(|statement| statement.find("cfg.").map(|p| &statement[p + 4..]))
            .map(|path| {
                path.chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
                    .collect::<String>()
            })
            .filter(|path| path.contains('.'));
        let slot = out.entry(key.to_string()).or_insert(None);
        if target.is_some() {
            *slot = target;
        }
    }
}

fn write_generated_keys() -> std::io::Result<()> {
    let config_source = fs::read_to_string(CONFIG_SOURCE)?;
    let keys = config_keys(&config_source);
    if keys.is_empty() {
        panic!("no config sections found for {ROOT_CONFIG} in {CONFIG_SOURCE}");
    }

    let mut rs_files = Vec::new();
    collect_rs_files(Path::new("src"), &mut rs_files)?;
    let mut env_keys = BTreeMap::new();
    for file in rs_files {
        if let Ok(content) = fs::read_to_string(&file) {
            let is_config = file == Path::new(CONFIG_SOURCE);
            collect_env_keys(&content, is_config, &mut env_keys);
        }
    }
    for (var, target) in &env_keys {
        if let Some(target) = target {
            if !keys.contains(target) {
                panic!("{var} overrides {target}, which is not a field of {ROOT_CONFIG}");
            }
        }
    }

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR is set by cargo");
    let generated = Path::new(&out_dir).join("commsync_config_keys.rs");
    let mut f = fs::File::create(generated)?;
    writeln!(f, "pub const CONFIG_KEYS: &[&str] = &[")?;
    for key in &keys {
        writeln!(f, "    {key:?},")?;
    }
    writeln!(f, "];")?;
    writeln!(f, "pub const ENV_KEYS: &[(&str, Option<&str>)] = &[")?;
    for (var, target) in &env_keys {
        writeln!(f, "    ({var:?}, {:?}),", target.as_deref())?;
    }
    writeln!(f, "];")?;
    Ok(())
}

fn main() {
    write_generated_keys().expect("failed to generate commsync config keys");

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();

    // Seconds and nanos since the epoch; unique enough to tell builds apart.
    let build_id = format!("{:x}-{:x}", now.as_secs(), now.subsec_nanos());

    println!("cargo:rustc-env=BUILD_UUID={}", build_id);
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src");
}
