//! The pipeline keeps converging while the broker refuses connections and
//! the stores fail intermittently.

mod common;

use stockcmd::ConsumerConfig;
use stockcmd_inventory::{AddComponent, ReadModelStore, YesNo, COMPONENT_FAMILY};
use stockcmd_memory::InMemoryBroker;
use stockcmd_testing::chaos::{ChaosBrokerExt, ChaosConfig};

use common::{eventually, fast_config, publisher, queue, site_asset, Pipeline, Stores};

fn components(count: usize) -> Vec<AddComponent> {
    (0..count)
        .map(|index| AddComponent {
            product_name: "Fan 80mm".to_string(),
            sn: format!("SN9{index:02}"),
            total_available: 1,
            urgent_or_not: YesNo::from(index % 2 == 0),
            order_or_not: YesNo::No,
            asset_id: site_asset().asset_id,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_connections_delay_but_do_not_lose_commands() {
    let broker = InMemoryBroker::new();
    let stores = &Stores::new();
    let chaotic = broker.clone().with_chaos(
        ChaosConfig::deterministic().with_connect_failure_probability(0.6),
    );
    let config = ConsumerConfig {
        fail_fast: false,
        ..fast_config()
    };
    let pipeline = Pipeline::start(&chaotic, stores, &config);

    let publisher = publisher(&broker);
    publisher.publish(&site_asset()).await.unwrap();
    eventually("the asset to be registered", || async move {
        stores.read.asset(site_asset().asset_id).await.unwrap().is_some()
    })
    .await;
    for command in components(6) {
        publisher.publish(&command).await.unwrap();
    }
    eventually("every component to be listed", || async move {
        stores
            .read
            .components_by_asset(site_asset().asset_id)
            .await
            .unwrap()
            .len()
            == 6
    })
    .await;

    assert_eq!(stores.write.component_count(), 6);
    pipeline.stop().await;
    assert_eq!(broker.ready_count(&queue(COMPONENT_FAMILY)), 0);
}

#[tokio::test]
async fn intermittent_store_failures_are_retried() {
    let broker = InMemoryBroker::new();
    let stores = &Stores::new();
    let pipeline = Pipeline::start(&broker, stores, &fast_config());
    let publisher = publisher(&broker);
    publisher.publish(&site_asset()).await.unwrap();
    eventually("the asset to be registered", || async move {
        stores.read.asset(site_asset().asset_id).await.unwrap().is_some()
    })
    .await;

    stores.write.fail_next_commits(1);
    stores.read.fail_next_applies(1);
    for command in components(3) {
        publisher.publish(&command).await.unwrap();
    }
    eventually("every component to be listed", || async move {
        stores
            .read
            .components_by_asset(site_asset().asset_id)
            .await
            .unwrap()
            .len()
            == 3
    })
    .await;

    let stats = pipeline.runtime(COMPONENT_FAMILY).stats();
    assert_eq!(stats.acked, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.dead_lettered, 0);
    pipeline.stop().await;
}
