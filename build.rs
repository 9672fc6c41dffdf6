use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    capture: Capture,
    session: Session,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    api_url: String,
    ws_url: String,
    api_token: String,
    user_id: String,
}

#[derive(Deserialize)]
struct Capture {
    device: String,
    noise_suppress_db: i32,
}

#[derive(Deserialize)]
struct Session {
    session_type: String,
    target_breath_duration: f64,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 网络配置
    println!("cargo:rustc-env=API_URL={}", config.network.api_url);
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=API_TOKEN={}", config.network.api_token);
    println!("cargo:rustc-env=USER_ID={}", config.network.user_id);

    // 采集配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.capture.device);
    println!("cargo:rustc-env=NOISE_SUPPRESS_DB={}", config.capture.noise_suppress_db);

    // 会话配置
    println!("cargo:rustc-env=SESSION_TYPE={}", config.session.session_type);
    println!(
        "cargo:rustc-env=TARGET_BREATH_DURATION={}",
        config.session.target_breath_duration
    );

    // SpeexDSP 只在 ALSA 采集后端启用时需要链接（ALSA 本身由 alsa-sys 处理）
    if std::env::var_os("CARGO_FEATURE_ALSA_BACKEND").is_none() {
        return;
    }

    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
