use std::{
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Environment variables the engine consults for its data-file locations and
/// XUDP session key.
pub const ENV_ASSET_LOCATION: &str = "STRIX_LOCATION_ASSET";
pub const ENV_CERT_LOCATION: &str = "STRIX_LOCATION_CERT";
pub const ENV_XUDP_BASEKEY: &str = "STRIX_XUDP_BASEKEY";

type AssetFallback = dyn Fn(&str) -> io::Result<Vec<u8>> + Send + Sync;

static ASSET_DIR: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));
static ASSET_FALLBACK: Lazy<RwLock<Option<Arc<AssetFallback>>>> = Lazy::new(|| RwLock::new(None));

/// Configures the process-wide pieces the engine expects before it starts:
/// the directory holding geosite/geoip data files (served both as the asset
/// and the certificate location) and the XUDP base key. Call once, before
/// the first start.
pub fn init_environment(asset_dir: &Path, xudp_base_key: &str) {
    unsafe {
        std::env::set_var(ENV_ASSET_LOCATION, asset_dir);
        std::env::set_var(ENV_CERT_LOCATION, asset_dir);
        if !xudp_base_key.is_empty() {
            std::env::set_var(ENV_XUDP_BASEKEY, xudp_base_key);
        }
    }
    *ASSET_DIR.write() = Some(asset_dir.to_path_buf());
    tracing::debug!(dir = debug(asset_dir), "environment initialized");
}

/// Registers the lookup used when an asset is absent from the filesystem,
/// typically the host platform's bundled-resource store.
pub fn set_asset_fallback(
    fallback: impl Fn(&str) -> io::Result<Vec<u8>> + Send + Sync + 'static,
) {
    *ASSET_FALLBACK.write() = Some(Arc::new(fallback));
}

/// Reads a data asset by the relative name the engine uses. Names are
/// resolved inside the configured asset directory and may not escape it;
/// files absent from the filesystem go through the registered fallback.
pub fn read_asset(name: &str) -> io::Result<Vec<u8>> {
    let dir = ASSET_DIR.read().clone().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "asset directory is not configured",
        )
    })?;
    let path = contain_path(&dir, name)?;
    match std::fs::read(&path) {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let fallback = ASSET_FALLBACK.read().clone();
            match fallback {
                Some(hook) => hook(name),
                None => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

/// Joins `name` onto `dir`, refusing anything that lexically escapes it.
fn contain_path(dir: &Path, name: &str) -> io::Result<PathBuf> {
    let escape = || {
        io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("asset path {name:?} escapes the asset directory"),
        )
    };
    let mut out = dir.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(escape());
                }
                out.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    // the asset configuration is process-global, so everything runs in one test
    #[test]
    fn asset_reading_end_to_end() {
        let dir = std::env::temp_dir().join(format!("strix-assets-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("geosite.dat"), b"sites").unwrap();

        init_environment(&dir, "basekey123");
        assert_eq!(
            std::env::var_os(ENV_ASSET_LOCATION).unwrap(),
            dir.as_os_str()
        );
        assert_eq!(std::env::var_os(ENV_CERT_LOCATION).unwrap(), dir.as_os_str());
        assert_eq!(std::env::var(ENV_XUDP_BASEKEY).unwrap(), "basekey123");

        assert_eq!(read_asset("geosite.dat").unwrap(), b"sites");
        // cleaning happens lexically, inside the directory
        assert_eq!(read_asset("sub/../geosite.dat").unwrap(), b"sites");

        for escapee in ["../geosite.dat", "../../etc/passwd", "/etc/passwd"] {
            let err = read_asset(escapee).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::PermissionDenied, "{escapee}");
        }

        let err = read_asset("geoip.dat").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        set_asset_fallback(|name| {
            if name == "geoip.dat" {
                Ok(b"ips".to_vec())
            } else {
                Err(io::Error::new(io::ErrorKind::NotFound, "not bundled"))
            }
        });
        assert_eq!(read_asset("geoip.dat").unwrap(), b"ips");
        assert!(read_asset("other.dat").is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
