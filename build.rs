fn main() {
    // Load .env file for default station credentials and cloud endpoint
    load_env_config();

    // Host builds (unit tests) link normally; only the firmware needs the ESP linker scripts
    if std::env::var_os("CARGO_FEATURE_ESP32C3").is_some() {
        linker_be_nice();
        // make sure linkall.x is the last linker script (otherwise might cause problems with flip-link)
        println!("cargo:rustc-link-arg=-Tlinkall.x");
    }
}

/// Compiled-in defaults used when neither the environment nor .env provide a value
const DEFAULTS: &[(&str, &str)] = &[
    ("WIFI_SSID", "iot-board"),
    ("WIFI_PASSWORD", "iot-board-psk"),
    ("WIFI_AUTH", "2"),
    ("CLOUD_ENDPOINT", ""),
];

/// Load environment configuration from .env file
/// Environment variables take priority over .env file values
fn load_env_config() {
    use std::env;
    use std::path::Path;

    // Tell cargo to rerun this build script if .env file changes
    println!("cargo:rerun-if-changed=.env");

    for (name, _) in DEFAULTS {
        println!("cargo:rerun-if-env-changed={}", name);
    }

    // Try to load .env file if it exists
    if Path::new(".env").exists() {
        match dotenvy::dotenv() {
            Ok(_) => println!("cargo:warning=Loaded .env file"),
            Err(e) => println!("cargo:warning=Failed to load .env file: {}", e),
        }
    }

    // Note: We need to handle the case where env vars are set to empty strings
    for (name, fallback) in DEFAULTS {
        let value = env::var(name)
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string());

        println!("cargo:rustc-env={}={}", name, value);
    }

    let auth = env::var("WIFI_AUTH").unwrap_or_default();
    if !auth.trim().is_empty() && !matches!(auth.trim(), "1" | "2" | "3" | "4") {
        println!("cargo:warning=WIFI_AUTH={} is not a known auth code (1-4)", auth.trim());
    }

    if env::var("CLOUD_ENDPOINT").map(|v| v.trim().is_empty()).unwrap_or(true) {
        println!("cargo:warning=CLOUD_ENDPOINT is empty - cloud.json will carry an empty endpoint");
    }
}

fn linker_be_nice() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        let kind = &args[1];
        let what = &args[2];

        match kind.as_str() {
            "undefined-symbol" => match what.as_str() {
                "_stack_start" => {
                    eprintln!();
                    eprintln!("💡 Is the linker script `linkall.x` missing?");
                    eprintln!();
                }
                "esp_wifi_preempt_enable"
                | "esp_wifi_preempt_yield_task"
                | "esp_wifi_preempt_task_create" => {
                    eprintln!();
                    eprintln!("💡 `esp-wifi` has no scheduler enabled. Make sure you have the `builtin-scheduler` feature enabled, or that you provide an external scheduler.");
                    eprintln!();
                }
                _ => (),
            },
            // we don't have anything helpful for "missing-lib" yet
            _ => {
                std::process::exit(1);
            }
        }

        std::process::exit(0);
    }

    println!(
        "cargo:rustc-link-arg=--error-handling-script={}",
        std::env::current_exe().unwrap().display()
    );
}
