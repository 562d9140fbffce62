use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use harness::cli::HarnessArgs;
use harness::{H, HarnessError, Suite};

#[derive(Parser)]
#[command(
    name = "harness-demo",
    about = "Run a small sample suite through the harness",
    version
)]
struct Cli {
    #[command(flatten)]
    harness: HarnessArgs,

    /// Include a test that fails, to show failure reporting
    #[arg(long)]
    with_failure: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let with_failure = cli.with_failure;

    let options = match cli.harness.into_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    let mut suite = match Suite::new(options) {
        Ok(suite) => suite,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    suite.add("Arithmetic", |h: &H| {
        h.run("add", |h: &H| {
            if 2 + 2 != 4 {
                h.error("2 + 2 != 4");
            }
        });
        h.run("skipped", |h: &H| h.skip("not supported on this platform"));
    });

    suite.add("Parallel", |h: &H| {
        for i in 0..3 {
            h.run(&format!("worker {i}"), move |h: &H| {
                h.parallel();
                thread::sleep(Duration::from_millis(50 * (i + 1)));
                h.log(format!("worker {i} done"));
            });
        }
    });

    suite.add("Files", |h: &H| {
        let dir = h.temp_dir("scratch");
        h.log(format!("scratch dir at {}", dir.display()));
    });

    if with_failure {
        suite.add("Broken", |h: &H| {
            h.run("nested", |h: &H| h.fatal("expected 200, got 500"));
        });
    }

    match suite.run() {
        Ok(_) => {}
        Err(HarnessError::SuiteFailed) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    }
}
