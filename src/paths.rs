use std::{path::PathBuf, sync::LazyLock};

pub static DEFAULT_MODFORGE_PATH: LazyLock<PathBuf> = LazyLock::new(|| {
    let mut path = dirs::home_dir().unwrap_or_default();

    if std::env::var("MODFORGE_XDG_PATH").is_ok() {
        path.push(".config")
    }

    path.push("Modforge");
    path
});

/// Computes a path under the Modforge data directory.
///
/// Returns a `&Path` referencing the data directory itself if no arguments
/// are passed in, or a `PathBuf` created by joining all of the arguments to
/// the base directory if at least one argument is passed in.
#[macro_export]
macro_rules! modforge_path {
    () => {
        $crate::paths::DEFAULT_MODFORGE_PATH.as_path()
    };

    ( $( $path:expr ),+ $(,)? ) => {
        [
            $crate::paths::DEFAULT_MODFORGE_PATH.as_path(),
            $( std::path::Path::new(&$path) ),+
        ].into_iter().collect::<std::path::PathBuf>()
    };
}
