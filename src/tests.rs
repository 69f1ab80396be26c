#[cfg(test)]
mod integration_tests {
    use crate::{
        cache_key, CaptureError, CaptureOptions, CaptureService, Config, DeviceClass,
    };
    use std::time::Duration;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_captures, 4);
        assert_eq!(config.max_concurrent_sessions, 10);
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert!(config.prewarm_enabled);
        assert_eq!(config.prewarm_count, 2);
        assert!(config.cache.enabled);
        assert!(config.cache.smart);
        assert_eq!(config.cache.ttl, Duration::from_secs(180));
    }

    #[test]
    fn test_options_parse_from_request_json() {
        let raw = r##"{
            "url": "https://example.com/pricing",
            "full_page": true,
            "device": "phone",
            "delay_secs": 3,
            "click": "#accept-cookies",
            "hide": ".chat-widget,.promo-banner",
            "grab_html": true
        }"##;

        let options: CaptureOptions = serde_json::from_str(raw).unwrap();
        assert_eq!(options.url, "https://example.com/pricing");
        assert!(options.full_page);
        assert_eq!(options.device, DeviceClass::Phone);
        assert_eq!(options.viewport(), (375, 667));
        assert_eq!(options.delay_secs, 3);
        assert_eq!(options.click.as_deref(), Some("#accept-cookies"));
        assert!(options.grab_html);
    }

    #[test]
    fn test_minimal_request_uses_defaults() {
        let options: CaptureOptions =
            serde_json::from_str(r#"{"url": "https://example.com"}"#).unwrap();
        assert!(!options.full_page);
        assert_eq!(options.device, DeviceClass::Desktop);
        assert_eq!(options.viewport(), (1920, 1080));
        assert_eq!(options.delay_secs, 0);
        assert!(options.click.is_none());
        assert!(options.hide.is_none());
        assert!(!options.grab_html);
    }

    #[test]
    fn test_cache_key_is_stable_across_calls() {
        let options: CaptureOptions =
            serde_json::from_str(r#"{"url": "https://example.com", "delay_secs": 2}"#).unwrap();
        assert_eq!(cache_key(&options), cache_key(&options));
        assert!(cache_key(&options).starts_with("capture:"));
    }

    #[test]
    fn test_chrome_args_generation() {
        let args = crate::get_chrome_args();
        assert!(args.contains(&"--no-sandbox".to_string()));
        assert!(args.contains(&"--disable-dev-shm-usage".to_string()));
        assert!(args.contains(&"--disable-gpu".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--js-flags=")));
    }

    #[test]
    fn test_browser_config_creation() {
        // An explicit executable path sidesteps auto-detection, which fails
        // on hosts without an installed Chrome.
        let config = Config {
            chrome_path: Some("/usr/bin/chromium".to_string()),
            ..Default::default()
        };
        assert!(crate::create_browser_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_uninitialized_service_rejects_and_recovers() {
        let config = Config {
            prewarm_enabled: false,
            ..Default::default()
        };
        let service = CaptureService::new(config).unwrap();
        let options = CaptureOptions::new("https://example.com");

        for _ in 0..3 {
            let err = service.capture(&options).await.unwrap_err();
            assert!(matches!(err, CaptureError::NotInitialized));
        }

        // Repeated failures must not consume permits or leak sessions.
        let stats = service.stats().await;
        assert_eq!(stats.active_sessions, 0);
        assert_eq!(stats.available_permits, stats.browser_cap);
    }

    // End-to-end capture against a real Chrome. Environments without a
    // usable browser only warn, mirroring how headless CI hosts behave.
    #[tokio::test]
    async fn test_real_capture_when_chrome_available() {
        let config = Config {
            prewarm_enabled: false,
            page_load_timeout: Duration::from_secs(15),
            ..Default::default()
        };
        let service = match CaptureService::new(config) {
            Ok(service) => service,
            Err(e) => {
                eprintln!("service creation failed: {e:?}");
                return;
            }
        };

        if let Err(e) = service.initialize().await {
            eprintln!("browser unavailable, skipping live capture: {e:?}");
            return;
        }

        let options = CaptureOptions::new("https://example.com");
        match service.capture(&options).await {
            Ok(result) => {
                assert!(!result.screenshot.is_empty());
                assert_eq!(result.screenshot_format, "png");
                assert!(!result.session_id.is_empty());
            }
            Err(e) => {
                eprintln!("live capture failed (may be expected in some environments): {e:?}");
            }
        }

        service.shutdown().await;
        let stats = service.stats().await;
        assert_eq!(stats.active_sessions, 0);
    }
}
