use std::env;
use std::path::PathBuf;

fn fallback_dotenv_path(commsync_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match commsync_home {
        Some(home) => Some(home.join(".env")),
        None => Some(home_dir?.join(".commsync").join(".env")),
    }
}

/// Load credentials from `./.env`, falling back to the commsync home.
/// Variables already set in the environment always win.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("COMMSYNC_HOME").map(PathBuf::from),
        dirs::home_dir(),
    );

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::fallback_dotenv_path;
    use std::path::PathBuf;

    #[test]
    fn fallback_prefers_commsync_home() {
        let got = fallback_dotenv_path(
            Some(PathBuf::from("/srv/commsync")),
            Some(PathBuf::from("/home/alice")),
        );
        assert_eq!(got, Some(PathBuf::from("/srv/commsync/.env")));
    }

    #[test]
    fn fallback_uses_dot_dir_under_home() {
        let got = fallback_dotenv_path(None, Some(PathBuf::from("/home/alice")));
        assert_eq!(got, Some(PathBuf::from("/home/alice/.commsync/.env")));
    }

    #[test]
    fn no_home_means_no_fallback() {
        assert_eq!(fallback_dotenv_path(None, None), None);
    }
}
