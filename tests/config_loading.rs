use alarm_server::config::{parse_shelving_options, ServerConfig, TreeConfig};
use alarm_server::tree::ItemConfig;
use alarm_server::AlarmTree;
use std::io::Write;
use std::time::Duration;

const TREE: &str = r#"
root:
  guidance:
    - title: Call
      detail: Control room x1234
children:
  - name: RF
    children:
      - name: Cavity1
        pv:
          description: Cavity 1 field
          delay: 10
          actions:
            - title: Email RF group
              detail: "mailto:rf@example.org"
              delay: 60
  - name: "Beam:Current"
    pv:
      annunciating: false
"#;

#[test]
fn test_tree_file_populates_tree() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(TREE.as_bytes()).unwrap();

    let yaml = format!(
        "config_name: Linac\ntree_file: \"{}\"\n",
        file.path().display()
    );
    let config = ServerConfig::from_yaml(&yaml).unwrap();
    let tree_config = config.load_tree().unwrap().unwrap();

    let tree = AlarmTree::new(&config.config_name).unwrap();
    assert_eq!(tree_config.populate(&tree).unwrap(), 2);
    assert_eq!(
        tree.paths(),
        vec!["/Linac", "/Linac/RF", "/Linac/RF/Cavity1", "/Linac/Beam:Current"]
    );

    match tree.config("/Linac/RF/Cavity1").unwrap() {
        ItemConfig::Pv(pv) => {
            assert_eq!(pv.delay, 10);
            assert_eq!(pv.actions[0].delay(), Duration::from_secs(60));
            assert_eq!(pv.actions[0].prefix(), Some("mailto:"));
        }
        other => panic!("expected a PV, got {:?}", other),
    }
    match tree.config("/Linac").unwrap() {
        ItemConfig::Group(group) => assert_eq!(group.guidance[0].title, "Call"),
        other => panic!("expected a group, got {:?}", other),
    }
}

#[test]
fn test_invalid_tree_rejected() {
    let bad = "children:\n  - name: x\n    pv: {}\n    children:\n      - name: y\n";
    let tree: TreeConfig = serde_yaml::from_str(bad).unwrap();
    assert!(tree.validate().is_err());

    assert!(ServerConfig::from_yaml("config_name: \"a/b\"").is_err());
    assert!(ServerConfig::from_yaml("actions:\n  workers: 0").is_err());
}

#[test]
fn test_defaults() {
    let config = ServerConfig::from_yaml("{}").unwrap();
    assert_eq!(config.config_name, "Accelerator");
    assert_eq!(config.topics().command, "AcceleratorCommand");
    assert_eq!(config.nag_period(), Some(Duration::from_secs(900)));
    assert_eq!(config.idle_timeout(), Duration::from_secs(10));
    assert!(config.load_tree().unwrap().is_none());
    assert_eq!(
        config.shelving()[0..2],
        [Duration::from_secs(3600), Duration::from_secs(6 * 3600)]
    );
}

#[test]
fn test_shelving_options_skip_garbage() {
    let options = parse_shelving_options("30 minutes, soon, 0 hours, 2 wk");
    assert_eq!(
        options,
        vec![Duration::from_secs(1800), Duration::from_secs(14 * 86400)]
    );
}
