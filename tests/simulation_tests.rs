//! Tests for the portfolio controller end to end

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use simfolio::broadcast::PortfolioEvent;
    use simfolio::config::AppConfig;
    use simfolio::market_data::PriceTable;
    use simfolio::persistence::{JsonFileStore, MemoryStore, Store};
    use simfolio::types::{NewPortfolio, SimulationCommand, StreamOptions, TradeRequest, TradeType};
    use simfolio::{EngineError, PortfolioController};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_stream::wrappers::BroadcastStream;
    use tokio_stream::StreamExt;
    use tokio_test::{assert_err, assert_ok};

    fn date(d: &str) -> NaiveDate {
        NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap()
    }

    fn prices() -> PriceTable {
        let mut table = PriceTable::new()
            .with_name("ACME", "Acme Corp")
            .with_name("WIDG", "Widget Inc");
        // Weekdays only, Jan-Mar 2022; ACME climbs 1/day, WIDG is flat
        let mut day = date("2022-01-03");
        let mut n = 0.0;
        while day <= date("2022-03-31") {
            let weekday = day.format("%u").to_string();
            if weekday != "6" && weekday != "7" {
                table.insert_close("ACME", day, 100.0 + n);
                table.insert_close("WIDG", day, 20.0);
                n += 1.0;
            }
            day = day.succ_opt().unwrap();
        }
        table
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.simulation.poll_interval_ms = 20;
        config.simulation.stop_timeout_ms = 2000;
        config
    }

    fn controller() -> PortfolioController {
        controller_with_store(Arc::new(MemoryStore::new()))
    }

    fn controller_with_store(store: Arc<dyn Store>) -> PortfolioController {
        PortfolioController::from_config(store, Arc::new(prices()), &fast_config())
    }

    fn request(name: &str, balance: f64) -> NewPortfolio {
        NewPortfolio {
            name: name.into(),
            start_date: "2022-01-03".into(),
            initial_balance: balance,
            simulation_speed: None,
        }
    }

    // ============================================================================
    // Trading
    // ============================================================================

    #[tokio::test]
    async fn test_acme_buy_sell_scenario() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Growth", 10_000.0)).await.unwrap();

        let buy = ctl
            .buy("u1", &p.id, TradeRequest::new("ACME", 10.0).at_price(100.0))
            .await
            .unwrap();
        assert_eq!(buy.trade_type, TradeType::Buy);
        assert_eq!(buy.total, 1_000.0);

        let sell = ctl
            .sell("u1", &p.id, TradeRequest::new("ACME", 4.0).at_price(120.0))
            .await
            .unwrap();
        assert_eq!(sell.gain_loss, Some(80.0));

        let detail = ctl.get_portfolio("u1", &p.id).await.unwrap();
        assert_eq!(detail.cash_balance, 9_480.0);
        let holding = detail.holding("ACME").unwrap();
        assert_eq!(holding.quantity, 6.0);
        assert_eq!(holding.average_buy_price, 100.0);
        assert_eq!(holding.name, "Acme Corp");

        let txs = ctl.transactions("u1", &p.id).await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].trade_type, TradeType::Sell);
        assert_eq!(txs[1].trade_type, TradeType::Buy);
    }

    #[tokio::test]
    async fn test_trade_on_weekend_uses_friday_close() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Weekend", 10_000.0)).await.unwrap();
        // 2022-01-08 is a Saturday
        ctl.control_simulation(
            "u1",
            &p.id,
            SimulationCommand::SetDate { target_date: "2022-01-08".into() },
        )
        .await
        .unwrap();

        let tx = ctl.buy("u1", &p.id, TradeRequest::new("acme", 1.0)).await.unwrap();
        // Fifth trading day closes at 104
        assert_eq!(tx.price, 104.0);
        assert_eq!(tx.trade_date, date("2022-01-08"));
    }

    #[tokio::test]
    async fn test_trade_errors_surface() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Small", 500.0)).await.unwrap();

        assert!(matches!(
            ctl.buy("u1", &p.id, TradeRequest::new("ACME", 10.0)).await,
            Err(EngineError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            ctl.buy("u1", &p.id, TradeRequest::new("NOPE", 1.0)).await,
            Err(EngineError::PriceUnavailable { .. })
        ));
        assert!(matches!(
            ctl.sell("u1", &p.id, TradeRequest::new("ACME", 1.0)).await,
            Err(EngineError::NoSuchHolding(_))
        ));
        assert!(ctl.transactions("u1", &p.id).await.unwrap().is_empty());
    }

    // ============================================================================
    // Ownership
    // ============================================================================

    #[tokio::test]
    async fn test_forbidden_vs_not_found() {
        let ctl = controller();
        let p = ctl.create_portfolio("owner", request("Mine", 1_000.0)).await.unwrap();

        assert!(matches!(
            ctl.get_portfolio("intruder", &p.id).await,
            Err(EngineError::Forbidden { .. })
        ));
        assert!(matches!(
            ctl.buy("intruder", &p.id, TradeRequest::new("ACME", 1.0)).await,
            Err(EngineError::Forbidden { .. })
        ));
        assert!(matches!(
            ctl.delete_portfolio("intruder", &p.id).await,
            Err(EngineError::Forbidden { .. })
        ));
        assert!(matches!(
            ctl.get_portfolio("owner", "does-not-exist").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(ctl.list_portfolios("intruder").await.unwrap().is_empty());
        assert_eq!(ctl.list_portfolios("owner").await.unwrap().len(), 1);
    }

    // ============================================================================
    // Clock control
    // ============================================================================

    #[tokio::test]
    async fn test_advance_requires_active_simulation() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Clock", 10_000.0)).await.unwrap();

        assert!(matches!(
            ctl.advance("u1", &p.id, 1).await,
            Err(EngineError::NotActive(_))
        ));

        let status = ctl
            .control_simulation("u1", &p.id, SimulationCommand::Start { simulation_speed: Some(1.0) })
            .await
            .unwrap();
        assert!(status.is_active);
        assert!(ctl.is_simulation_running(&p.id).await);

        ctl.buy("u1", &p.id, TradeRequest::new("ACME", 10.0)).await.unwrap();
        let advanced = ctl.advance("u1", &p.id, 3).await.unwrap();
        assert_eq!(advanced.current_date, date("2022-01-06"));
        // Thursday close is 103
        assert_eq!(advanced.holding("ACME").unwrap().current_price, 103.0);
        assert!(matches!(
            ctl.advance("u1", &p.id, 0).await,
            Err(EngineError::Validation(_))
        ));

        let history = ctl.stock_history("u1", &p.id, "ACME").await.unwrap();
        assert_eq!(history.history.get(&date("2022-01-06")), Some(&103.0));

        let paused = ctl
            .control_simulation("u1", &p.id, SimulationCommand::Pause)
            .await
            .unwrap();
        assert!(!paused.is_active);
        assert!(!ctl.is_simulation_running(&p.id).await);
        assert!(matches!(
            ctl.advance("u1", &p.id, 1).await,
            Err(EngineError::NotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_set_date_and_reset() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Dates", 10_000.0)).await.unwrap();
        ctl.buy("u1", &p.id, TradeRequest::new("ACME", 10.0)).await.unwrap();

        let err = ctl
            .control_simulation(
                "u1",
                &p.id,
                SimulationCommand::SetDate { target_date: "2021-12-31".into() },
            )
            .await;
        assert!(matches!(err, Err(EngineError::InvalidDate(_))));
        let err = ctl
            .control_simulation(
                "u1",
                &p.id,
                SimulationCommand::SetDate { target_date: "not-a-date".into() },
            )
            .await;
        assert!(matches!(err, Err(EngineError::InvalidDate(_))));

        let status = ctl
            .control_simulation(
                "u1",
                &p.id,
                SimulationCommand::SetDate { target_date: "2022-01-14".into() },
            )
            .await
            .unwrap();
        assert_eq!(status.current_date, date("2022-01-14"));
        let detail = ctl.get_portfolio("u1", &p.id).await.unwrap();
        // Tenth trading day closes at 109
        assert_eq!(detail.holding("ACME").unwrap().current_price, 109.0);
        assert_eq!(detail.current_balance, 9_000.0 + 1_090.0);

        let status = ctl
            .control_simulation("u1", &p.id, SimulationCommand::Reset)
            .await
            .unwrap();
        assert_eq!(status.current_date, date("2022-01-03"));
        let detail = ctl.get_portfolio("u1", &p.id).await.unwrap();
        assert_eq!(detail.holding("ACME").unwrap().current_price, 100.0);
    }

    // ============================================================================
    // Background scheduler
    // ============================================================================

    #[tokio::test]
    async fn test_background_loop_publishes_and_stops_on_delete() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Fast", 10_000.0)).await.unwrap();
        ctl.buy("u1", &p.id, TradeRequest::new("ACME", 5.0)).await.unwrap();

        let mut events = BroadcastStream::new(ctl.subscribe_events());

        // 100 simulated days per wall-clock second
        ctl.control_simulation(
            "u1",
            &p.id,
            SimulationCommand::Start { simulation_speed: Some(8_640_000.0) },
        )
        .await
        .unwrap();

        let advanced = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(event) = events.next().await {
                if let Ok(PortfolioEvent::SimulationAdvanced { current_date, .. }) = event {
                    return Some(current_date);
                }
            }
            None
        })
        .await
        .unwrap();
        assert!(advanced.unwrap() > date("2022-01-03"));

        assert_ok!(ctl.delete_portfolio("u1", &p.id).await);
        assert!(!ctl.is_simulation_running(&p.id).await);
        assert!(matches!(
            ctl.get_portfolio("u1", &p.id).await,
            Err(EngineError::NotFound(_))
        ));
        assert!(ctl.list_portfolios("u1").await.unwrap().is_empty());
        assert!(ctl.stock_history("u1", &p.id, "ACME").await.is_err());
    }

    #[tokio::test]
    async fn test_double_start_keeps_single_loop() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Twice", 10_000.0)).await.unwrap();
        let start = SimulationCommand::Start { simulation_speed: None };

        let (a, b) = tokio::join!(
            ctl.control_simulation("u1", &p.id, start.clone()),
            ctl.control_simulation("u1", &p.id, start.clone()),
        );
        assert_ok!(a);
        assert_ok!(b);
        assert_eq!(ctl.scheduler().running_count().await, 1);

        let reports = ctl.shutdown().await;
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_clean());
        assert_eq!(ctl.scheduler().running_count().await, 0);

        // Shutdown leaves the record inactive
        let detail = ctl.get_portfolio("u1", &p.id).await.unwrap();
        assert!(!detail.is_active);
    }

    #[tokio::test]
    async fn test_stop_without_loop_is_noop() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Idle", 10_000.0)).await.unwrap();
        let status = ctl
            .control_simulation("u1", &p.id, SimulationCommand::Pause)
            .await
            .unwrap();
        assert!(!status.is_active);
        assert!(ctl.shutdown().await.is_empty());
    }

    // ============================================================================
    // Performance & comparison
    // ============================================================================

    #[tokio::test]
    async fn test_compare_portfolios() {
        let ctl = controller();
        let a = ctl.create_portfolio("u1", request("Acme", 10_000.0)).await.unwrap();
        let b = ctl.create_portfolio("u1", request("Widget", 5_000.0)).await.unwrap();
        ctl.buy("u1", &a.id, TradeRequest::new("ACME", 50.0)).await.unwrap();
        ctl.buy("u1", &b.id, TradeRequest::new("WIDG", 50.0)).await.unwrap();

        for id in [&a.id, &b.id] {
            ctl.control_simulation(
                "u1",
                id,
                SimulationCommand::SetDate { target_date: "2022-01-31".into() },
            )
            .await
            .unwrap();
        }

        let comparison = ctl
            .compare("u1", &[a.id.clone(), b.id.clone()])
            .await
            .unwrap();
        assert_eq!(comparison.portfolios.len(), 2);
        assert_eq!(comparison.portfolios[0].name, "Acme");
        assert_eq!(comparison.comparison_metrics.total_return.len(), 2);
        assert!(comparison.comparison_metrics.total_return[0] > 0.0);
        assert_eq!(comparison.comparison_metrics.total_return[1], 0.0);

        assert_err!(ctl.compare("u1", &[]).await);
        assert!(matches!(
            ctl.compare("u2", &[a.id.clone()]).await,
            Err(EngineError::Forbidden { .. })
        ));

        let perf = ctl.performance("u1", &a.id).await.unwrap();
        assert_eq!(perf.metrics.total_return, perf.performance);
        assert!(perf.performance_history.len() >= 2);
    }

    #[tokio::test]
    async fn test_subscription_paths_for_holdings() {
        let ctl = controller();
        let p = ctl.create_portfolio("u1", request("Paths", 10_000.0)).await.unwrap();
        ctl.buy("u1", &p.id, TradeRequest::new("WIDG", 2.0)).await.unwrap();

        let paths = ctl
            .subscription_paths("u1", &p.id, StreamOptions::default())
            .await
            .unwrap();
        assert!(paths.enabled);
        assert!(paths.holdings.is_some());
        assert!(paths.transactions.is_none());
        assert!(paths.stock_history.contains_key("WIDG"));
    }

    // ============================================================================
    // Persistence
    // ============================================================================

    #[tokio::test]
    async fn test_file_store_survives_restart() {
        let dir = std::env::temp_dir().join(format!("simfolio_it_{}", uuid::Uuid::new_v4()));
        let path = dir.join("store.json");

        let id = {
            let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
            let ctl = controller_with_store(store);
            let p = ctl.create_portfolio("u1", request("Durable", 10_000.0)).await.unwrap();
            ctl.buy("u1", &p.id, TradeRequest::new("ACME", 3.0)).await.unwrap();
            p.id
        };

        let store = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let ctl = controller_with_store(store);
        let detail = ctl.get_portfolio("u1", &id).await.unwrap();
        assert_eq!(detail.cash_balance, 9_700.0);
        assert_eq!(detail.transactions.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
