use alarm_server::tree::{GroupConfig, PvConfig};
use alarm_server::{AlarmState, AlarmTree, SeverityLevel};
use chrono::Utc;
use proptest::prelude::*;

fn severity() -> impl Strategy<Value = SeverityLevel> {
    prop_oneof![
        Just(SeverityLevel::Ok),
        Just(SeverityLevel::Minor),
        Just(SeverityLevel::Major),
        Just(SeverityLevel::Invalid),
        Just(SeverityLevel::Undefined),
    ]
}

fn build(groups: usize, pvs: usize, latching: bool) -> (AlarmTree, Vec<String>) {
    let tree = AlarmTree::new("Prop").unwrap();
    let mut leaves = Vec::new();
    for g in 0..groups {
        let group = tree
            .add_group("/Prop", &format!("G{}", g), GroupConfig::default())
            .unwrap();
        for p in 0..pvs {
            let config = PvConfig {
                latching,
                ..PvConfig::default()
            };
            leaves.push(tree.add_pv(&group, &format!("pv{}", p), config).unwrap());
        }
    }
    (tree, leaves)
}

proptest! {
    #[test]
    fn test_groups_show_worst_child(
        latching in any::<bool>(),
        updates in prop::collection::vec((0usize..12, severity(), any::<bool>()), 1..200)
    ) {
        let (tree, leaves) = build(3, 4, latching);
        for (index, severity, ack) in updates {
            let path = &leaves[index % leaves.len()];
            tree.update_pv(path, &AlarmState::new(severity, "", "", Utc::now())).unwrap();
            if ack {
                tree.acknowledge(path, true).unwrap();
            }
        }

        for group in ["/Prop/G0", "/Prop/G1", "/Prop/G2"] {
            let worst = leaves
                .iter()
                .filter(|leaf| leaf.starts_with(&format!("{}/", group)))
                .map(|leaf| tree.severity(leaf).unwrap())
                .max()
                .unwrap();
            prop_assert_eq!(tree.severity(group).unwrap(), worst);
        }
        let worst = leaves.iter().map(|leaf| tree.severity(leaf).unwrap()).max().unwrap();
        prop_assert_eq!(tree.severity("/Prop").unwrap(), worst);
    }

    #[test]
    fn test_latched_never_below_current(
        updates in prop::collection::vec(severity(), 1..100)
    ) {
        let (tree, leaves) = build(1, 1, true);
        let path = &leaves[0];
        for severity in updates {
            tree.update_pv(path, &AlarmState::new(severity, "", "", Utc::now())).unwrap();
            let state = tree.pv_state(path).unwrap();
            // Unacknowledged latch holds at least the current severity
            prop_assert!(state.severity.base_rank() >= state.current_severity.base_rank());
            prop_assert_eq!(state.current_severity, severity);
        }
    }
}
