use alarm_server::broker::{LocalLog, MessageLog, Retention};
use alarm_server::protocol::{config_messages, decode, TopicNames};
use alarm_server::tree::{GroupConfig, ItemConfig, PvConfig, TitleDetailDelay};
use alarm_server::{AlarmClientModel, AlarmTree};
use bytes::Bytes;
use std::time::Duration;
use tokio_test::assert_ok;

fn sample_tree() -> AlarmTree {
    let tree = AlarmTree::new("Facility").unwrap();
    let hall = tree
        .add_group("/Facility", "Hall", GroupConfig::default())
        .unwrap();
    let mut pv = PvConfig::with_description("Door interlock");
    pv.actions
        .push(TitleDetailDelay::new("Call", "cmd:page $(ON_CALL)", 30));
    tree.add_pv(&hall, "door", pv).unwrap();
    tree.add_pv(&hall, "fan", PvConfig::default()).unwrap();
    tree
}

#[tokio::test]
async fn test_configuration_round_trip() {
    let log = LocalLog::new();
    let topics = TopicNames::new("Facility");
    assert_ok!(log.create_topic(&topics.config, Retention::Compacted).await);

    let tree = sample_tree();
    for (key, payload) in config_messages(&tree).unwrap() {
        assert_ok!(log.send(&topics.config, &key, Some(payload)).await);
    }

    let model = AlarmClientModel::new("Facility").unwrap();
    let mut rx = log.subscribe(&[topics.config.clone()]).await.unwrap();
    let applied = model
        .apply_until_quiet(&mut rx, Duration::from_millis(50))
        .await;
    assert_eq!(applied, 4);
    assert_eq!(model.tree().paths(), tree.paths());
    assert_eq!(model.tree().item_configs(), tree.item_configs());
}

#[tokio::test]
async fn test_compacted_topic_drops_deleted_items() {
    let log = LocalLog::new();
    assert_ok!(log.create_topic("Facility", Retention::Compacted).await);
    let config = serde_json::to_vec(&ItemConfig::Pv(PvConfig::default())).unwrap();

    for _ in 0..3 {
        assert_ok!(
            log.send("Facility", "config:/Facility/a", Some(Bytes::from(config.clone())))
                .await
        );
    }
    assert_ok!(log.send("Facility", "config:/Facility/b", Some(Bytes::from(config))).await);
    assert_ok!(log.send("Facility", "config:/Facility/a", None).await);

    let records = log.records("Facility");
    let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["config:/Facility/b", "config:/Facility/a"]);
    assert!(records[1].is_tombstone());
    let b: ItemConfig = decode(records[0].payload.as_ref().unwrap()).unwrap();
    assert!(b.is_pv());
}
