use urdf_studio::config::ViewerConfig;
use urdf_studio::descriptor::{FileBlob, RigState, RobotDescriptor, URDF_MEDIA_TYPE};
use urdf_studio::lifecycle::SharedViewport;
use urdf_studio::protocol::ViewerCommands;
use urdf_studio::renderer::HeadlessRenderer;
use urdf_studio::scene::{SceneConfig, SceneConfigPatch};
use urdf_studio::store::{ModelStore, StoreWorker};
use urdf_studio::Session;

const GRIPPER_URDF: &str = r#"<robot name="gripper">
  <link name="palm"><visual><geometry><mesh filename="meshes/palm.stl"/></geometry></visual></link>
  <link name="finger"/>
  <joint name="pinch" type="prismatic"><parent link="palm"/><child link="finger"/><limit lower="0" upper="0.04"/></joint>
</robot>"#;

const PALM_STL: &str = "solid palm\nfacet normal 0 0 1\nouter loop\nvertex 0 0 0\nvertex 1 0 0\nvertex 0 1 0\nendloop\nendfacet\nendsolid palm\n";

fn gripper() -> RobotDescriptor {
    RobotDescriptor::with_id(
        "g1",
        "gripper.urdf",
        FileBlob::new("gripper.urdf", GRIPPER_URDF.as_bytes().to_vec()).with_media_type(URDF_MEDIA_TYPE),
        [FileBlob::new("palm.stl", PALM_STL.as_bytes().to_vec())],
    )
}

fn session_on(root: &std::path::Path, version: u32) -> Session {
    let store = ModelStore::open(root, version).expect("open store");
    let mut session = Session::new(SceneConfig::default(), ViewerConfig::default());
    session.restore(&store);
    let worker = StoreWorker::spawn(store).expect("spawn store worker");
    let mut session = session.with_store(worker);
    session.mount(Box::new(SharedViewport::new(320, 240)), Box::new(HeadlessRenderer::new()));
    session
}

#[test]
fn catalog_and_scene_config_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut session = session_on(dir.path(), 1);
        session.add_descriptor(gripper()).expect("add gripper");
        session.activate("g1").expect("activate gripper");
        let patch = SceneConfigPatch { fov: Some(50.0), show_grid: Some(false), ..Default::default() };
        session.set_scene_config(&patch).expect("patch scene");
        session.shutdown();
    }

    let mut session = session_on(dir.path(), 1);
    assert_eq!(session.catalog().len(), 1);
    assert_eq!(session.catalog().state("g1"), Some(RigState::Inactive), "restored models start inactive");
    assert_eq!(session.viewer().config().fov, 50.0);
    assert!(!session.viewer().config().show_grid);

    let restored = session.catalog().get("g1").expect("restored entry").descriptor.clone();
    assert_eq!(*restored, gripper());

    let loaded = session.activate("g1").expect("activate restored gripper");
    assert_eq!(loaded.joints, vec!["pinch"]);
}

#[test]
fn deleting_and_clearing_reach_the_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut session = session_on(dir.path(), 1);
        session.add_descriptor(gripper()).expect("add gripper");
        session.add_descriptor(RobotDescriptor::with_id(
            "g2",
            "spare.urdf",
            FileBlob::new("spare.urdf", GRIPPER_URDF.as_bytes().to_vec()),
            [FileBlob::new("palm.stl", PALM_STL.as_bytes().to_vec())],
        ))
        .expect("add spare");
        session.delete("g1").expect("delete g1");
        session.flush_store();
    }
    {
        let mut session = session_on(dir.path(), 1);
        let ids: Vec<_> = session.list_models().into_iter().map(|model| model.id).collect();
        assert_eq!(ids, vec!["g2"]);
        assert_eq!(session.clear_models(), 1);
        session.flush_store();
    }
    let session = session_on(dir.path(), 1);
    assert!(session.catalog().is_empty());
}

#[test]
fn version_change_discards_saved_models() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let mut session = session_on(dir.path(), 1);
        session.add_descriptor(gripper()).expect("add gripper");
        session.flush_store();
    }
    let session = session_on(dir.path(), 2);
    assert!(session.catalog().is_empty());

    let store = ModelStore::open(dir.path(), 2).expect("reopen");
    assert!(store.get_state().expect("read state").is_none());
}
