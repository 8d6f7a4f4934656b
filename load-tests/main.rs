#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]
#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod defs;

fn main() -> ExitCode {
    let root_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .canonicalize()
        .unwrap();
    let tests_path = Path::new("load-tests").join("tests");

    let args = libtest_mimic::Arguments::from_args();

    let tests = gather_tests(&root_path, &tests_path)
        .into_iter()
        .map(|test_path| {
            let full_test_path = root_path.join(&test_path);
            libtest_mimic::Trial::test(test_path.to_string_lossy(), move || {
                test::run_test(&full_test_path).map_err(Into::into)
            })
        })
        .collect();

    if libtest_mimic::run(&args, tests).has_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Finds every YAML file under `tests_path`, which is relative to
/// `root_path`.
fn gather_tests(root_path: &Path, tests_path: &Path) -> BTreeSet<PathBuf> {
    let mut tests = BTreeSet::new();
    let mut dir_queue = vec![tests_path.to_path_buf()];

    while let Some(sub_dir) = dir_queue.pop() {
        for entry in root_path.join(&sub_dir).read_dir().unwrap() {
            let entry = entry.unwrap();
            let entry_name = entry.file_name();

            if entry.file_type().unwrap().is_dir() {
                dir_queue.push(sub_dir.join(entry_name));
                continue;
            }

            let extension = Path::new(&entry_name).extension();
            if extension == Some(OsStr::new("yaml")) || extension == Some(OsStr::new("yml")) {
                assert!(tests.insert(sub_dir.join(entry_name)));
            }
        }
    }

    tests
}
