#[cfg(test)]
mod tests {
    use crate::arbitrage::tests::support::{BTC, ETH, Harness, btc_pair, new_pair, settle};
    use crate::arbitrage::types::PairStatus;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use spreadarb_core::notify::{NotificationKind, Severity};
    use spreadarb_core::store::Settings;

    fn one_at_a_time() -> Settings {
        Settings {
            max_concurrent_trades: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_concurrent_trade_limit_blocks_second_pair() {
        let h = Harness::with_settings(one_at_a_time()).await;
        let btc = h.btc_holding(btc_pair()).await;
        let eth = h.create_and_start(new_pair(ETH, "ETH")).await;

        // 1.2% on ETH, but the only slot is taken by BTC
        h.quote_bybit(ETH, dec!(3036), dec!(3037)).await;
        settle().await;
        assert_eq!(h.sync(eth).await.runtime.unwrap().status, PairStatus::Ready);
        assert_eq!(h.manager.active_trades(), 1);
        assert!(h.manager.list_orders(eth).await.unwrap().is_empty());

        // BTC exits and frees the slot
        h.quote_binance(BTC, dec!(50000), dec!(50010)).await;
        h.quote_bybit(BTC, dec!(50065), dec!(50075)).await;
        assert!(h.wait_status(btc, PairStatus::Ready).await);
        assert_eq!(h.manager.active_trades(), 0);

        h.quote_bybit(ETH, dec!(3037), dec!(3038)).await;
        assert!(h.wait_status(eth, PairStatus::Holding).await);
        assert_eq!(h.manager.active_trades(), 1);
    }

    #[tokio::test]
    async fn test_later_parts_do_not_take_another_slot() {
        let h = Harness::with_settings(one_at_a_time()).await;
        let mut pair = btc_pair();
        pair.params.n_orders = 2;
        let id = h.btc_holding(pair).await;

        h.quote_bybit(BTC, dec!(50610), dec!(50620)).await;
        settle().await;
        assert_eq!(h.sync(id).await.runtime.unwrap().filled_parts, 2);
        assert_eq!(h.manager.active_trades(), 1);
    }

    #[tokio::test]
    async fn test_raising_the_limit_takes_effect_immediately() {
        let h = Harness::with_settings(one_at_a_time()).await;
        h.btc_holding(btc_pair()).await;
        let eth = h.create_and_start(new_pair(ETH, "ETH")).await;

        let settings = Settings {
            max_concurrent_trades: Some(2),
            ..Default::default()
        };
        h.manager.update_settings(settings).await.unwrap();

        h.quote_bybit(ETH, dec!(3036), dec!(3037)).await;
        assert!(h.wait_status(eth, PairStatus::Holding).await);
        assert_eq!(h.manager.active_trades(), 2);
    }

    #[tokio::test]
    async fn test_margin_shortfall_skips_entry_and_warns_once() {
        let h = Harness::new().await;
        let id = h.create_and_start(btc_pair()).await;
        h.bybit.set_quote_balance(dec!(100)).await;

        h.quote_bybit(BTC, dec!(50600), dec!(50610)).await;
        h.quote_bybit(BTC, dec!(50601), dec!(50611)).await;
        settle().await;

        assert_eq!(h.sync(id).await.runtime.unwrap().status, PairStatus::Ready);
        assert_eq!(h.manager.active_trades(), 0);
        assert!(h.bybit.get_state().await.submitted.is_empty());
        let margin: Vec<_> = h
            .notifications()
            .await
            .into_iter()
            .filter(|n| n.kind == NotificationKind::Margin)
            .collect();
        assert_eq!(margin.len(), 1);
        assert_eq!(margin[0].severity, Severity::Warn);

        // balance restored: the next tick enters
        h.bybit.set_quote_balance(dec!(100000)).await;
        h.quote_bybit(BTC, dec!(50602), dec!(50612)).await;
        assert!(h.wait_status(id, PairStatus::Holding).await);
        assert_eq!(h.bybit.position(BTC).await, dec!(-0.5));
        assert_ne!(h.binance.position(BTC).await, Decimal::ZERO);
    }
}
