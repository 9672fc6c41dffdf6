use std::sync::Arc;

use anyhow::Context;
use breath_link::audio::{AudioCapture, CaptureBackend, CaptureConstraints};
use breath_link::session_api::{SessionService, SessionType};
use breath_link::{
    BreathEvent, Config, ConnectionState, Session, SessionChannel, SessionController,
    SessionError, SessionObserver,
};
use tokio::signal;
use uuid::Uuid;

/// Prints session progress to the terminal.
#[derive(Default)]
struct ConsoleObserver {
    fatal: Option<SessionError>,
}

impl SessionObserver for ConsoleObserver {
    fn on_breath_event(&mut self, event: &BreathEvent) {
        let number = event
            .breath_number
            .map(|n| format!("#{}", n))
            .unwrap_or_else(|| "-".to_string());
        let pace = match (event.duration_ms, event.is_consistent) {
            (Some(ms), Some(true)) => format!(" {:.1}s on pace", ms / 1000.0),
            (Some(ms), _) => format!(" {:.1}s", ms / 1000.0),
            _ => String::new(),
        };
        println!(
            "[{}] breath {} {:?} (confidence {:.2}){}",
            event.timestamp, number, event.phase, event.confidence, pace
        );
    }

    fn on_calibrated(&mut self) {
        println!("Calibration complete, guided breathing active");
    }

    fn on_error(&mut self, error: &SessionError) {
        eprintln!("Session error: {}", error);
        if error.is_fatal() {
            self.fatal = Some(error.clone());
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        println!("Channel: {:?}", state);
    }
}

#[cfg(feature = "alsa-backend")]
fn capture_backend() -> anyhow::Result<Arc<dyn CaptureBackend>> {
    Ok(Arc::new(breath_link::audio::AlsaBackend))
}

#[cfg(not(feature = "alsa-backend"))]
fn capture_backend() -> anyhow::Result<Arc<dyn CaptureBackend>> {
    anyhow::bail!("built without the alsa-backend feature, no microphone available")
}

/// 通过会话服务获取会话，未配置时使用本地生成的会话ID
async fn resolve_session(config: &Config) -> anyhow::Result<(Session, String)> {
    if !config.has_session_service() {
        let session = Session::new(
            Uuid::new_v4().to_string(),
            config.user_id.clone(),
            config.target_breath_duration,
        );
        println!("No session service configured, using local session {}", session.session_id);
        return Ok((session, config.ws_url.clone()));
    }

    let service = SessionService::new(&config.api_url, &config.api_token)
        .context("Invalid session service configuration")?;
    let issued = service
        .start_session(
            SessionType::from_config(&config.session_type),
            config.target_breath_duration,
            None,
        )
        .await
        .context("Failed to start session")?;
    let ws_url = service.breath_socket_url()?;
    Ok((issued.to_session(), ws_url.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::init();

    // 加载配置
    let config = Config::load().unwrap_or_default();
    println!("{} v{}", config.app_name, config.app_version);

    let (session, ws_url) = resolve_session(&config).await?;

    let capture = AudioCapture::new(capture_backend()?, CaptureConstraints::from_config(&config));
    let channel = SessionChannel::new(ws_url);
    let mut controller =
        SessionController::new(session, channel, capture, ConsoleObserver::default());

    // 先建立连接，再打开麦克风
    if controller.connect().await.is_ok() && controller.start_audio_capture().await.is_ok() {
        println!("Breathe along, Ctrl-C to finish");
        tokio::select! {
            _ = controller.run() => {}
            _ = signal::ctrl_c() => println!("Stopping session..."),
        }
    }

    controller.disconnect();
    controller.wait_closed().await;

    println!(
        "Session {}: {} breaths, calibrated: {}, frames sent: {}, dropped: {}",
        controller.session().session_id,
        controller.breath_count(),
        !controller.is_calibrating(),
        controller.frames_sent(),
        controller.frames_dropped(),
    );

    if let Some(e) = controller.observer().fatal.clone() {
        anyhow::bail!("session ended with error: {}", e);
    }
    Ok(())
}
