//! One viewer session: the subsystems, the model catalog and the store, wired together.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::config::ViewerConfig;
use crate::descriptor::{ModelCatalog, RigState, RobotDescriptor};
use crate::error::{ViewerError, ViewerResult};
use crate::geometry::LoaderRegistry;
use crate::joints::{Axis, JointAliasMap, JointController, JointTarget, JointUpdate, RobotSnapshot};
use crate::lifecycle::{ViewDirection, Viewer, ViewportHost};
use crate::loading::LoadingPipeline;
use crate::protocol::{LoadModelData, ModelSummary, Publisher, RobotLoaded, ViewerCommands};
use crate::renderer::RenderBackend;
use crate::scene::{SceneConfig, SceneConfigPatch};
use crate::store::{AppStateRecord, ModelStore, StoreWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Transient user-facing message about uploads, activation and deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

pub struct Session {
    viewer: Viewer,
    pipeline: LoadingPipeline,
    joints: JointController,
    catalog: ModelCatalog,
    publisher: Publisher,
    store: Option<StoreWorker>,
    notices: VecDeque<Notice>,
}

impl Session {
    pub fn new(scene: SceneConfig, settings: ViewerConfig) -> Self {
        Self {
            viewer: Viewer::new(scene, settings),
            pipeline: LoadingPipeline::new(LoaderRegistry::with_defaults()),
            joints: JointController::new(),
            catalog: ModelCatalog::new(),
            publisher: Publisher::detached(),
            store: None,
            notices: VecDeque::new(),
        }
    }

    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_store(mut self, store: StoreWorker) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_loaders(mut self, loaders: LoaderRegistry) -> Self {
        self.pipeline = LoadingPipeline::new(loaders);
        self
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    pub fn viewer_mut(&mut self) -> &mut Viewer {
        &mut self.viewer
    }

    pub fn joints(&self) -> &JointController {
        &self.joints
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn pipeline(&self) -> &LoadingPipeline {
        &self.pipeline
    }

    /// Mounts the viewer and starts observing resizes.
    pub fn mount(&mut self, container: Box<dyn ViewportHost>, renderer: Box<dyn RenderBackend>) {
        self.viewer.init(container, renderer);
        self.viewer.observe_resize();
    }

    pub fn frame(&mut self, now: Instant) -> bool {
        self.viewer.frame(now)
    }

    /// Loads the saved scene config and catalog. Restored models start inactive.
    pub fn restore(&mut self, store: &ModelStore) -> usize {
        let state = match store.get_state() {
            Ok(Some(state)) => state,
            Ok(None) => return 0,
            Err(err) => {
                log::warn!("{err}");
                return 0;
            }
        };
        self.viewer.apply_config(state.scene_config);
        let restored = store.restore(&state.descriptors);
        let count = restored.len();
        if count < state.descriptors.len() {
            log::warn!("[session] {} stored model(s) could not be restored", state.descriptors.len() - count);
        }
        for descriptor in restored {
            self.catalog.insert(descriptor);
        }
        log::info!("[session] restored {count} model(s)");
        count
    }

    /// Adds a descriptor to the catalog and persists it. Uploading the same description under
    /// the same name again returns the existing entry; a different description under a taken id
    /// or name is rejected.
    pub fn add_descriptor(&mut self, descriptor: RobotDescriptor) -> ViewerResult<Arc<RobotDescriptor>> {
        let taken = self.catalog.get(&descriptor.id).or_else(|| self.catalog.find_by_name(&descriptor.name));
        if let Some(existing) = taken.map(|entry| &entry.descriptor) {
            if existing.name == descriptor.name && existing.description.bytes == descriptor.description.bytes {
                log::info!("[session] {} already uploaded as {}", descriptor.name, existing.id);
                return Ok(existing.clone());
            }
            return Err(ViewerError::protocol(format!(
                "{} ({}) conflicts with uploaded model {} ({})",
                descriptor.name, descriptor.id, existing.name, existing.id
            )));
        }
        let descriptor = self.catalog.insert(descriptor);
        if let Some(store) = &self.store {
            store.save(descriptor.clone());
        }
        self.persist_state();
        self.notify(NoticeLevel::Success, format!("Uploaded {}", descriptor.name));
        Ok(descriptor)
    }

    pub fn activate(&mut self, robot_id: &str) -> ViewerResult<RobotLoaded> {
        let descriptor = self
            .catalog
            .get(robot_id)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| ViewerError::RobotNotFound(robot_id.to_string()))?;
        match self.pipeline.activate(&descriptor, &mut self.viewer, &mut self.joints, &self.publisher) {
            Ok(loaded) => {
                self.catalog.set_state(robot_id, RigState::Active)?;
                self.notify(NoticeLevel::Success, format!("Loaded {}", descriptor.name));
                Ok(loaded)
            }
            Err(err) => {
                self.notify(NoticeLevel::Error, err.to_string());
                Err(err)
            }
        }
    }

    pub fn deactivate(&mut self, robot_id: &str) -> ViewerResult<()> {
        if !self.catalog.contains(robot_id) {
            return Err(ViewerError::RobotNotFound(robot_id.to_string()));
        }
        self.pipeline.deactivate(robot_id, &mut self.viewer, &mut self.joints);
        self.catalog.set_state(robot_id, RigState::Inactive)
    }

    /// Deactivates if needed, then removes the descriptor from the catalog and the store.
    pub fn delete(&mut self, robot_id: &str) -> ViewerResult<()> {
        self.deactivate(robot_id)?;
        let descriptor = self.catalog.remove(robot_id)?;
        if let Some(store) = &self.store {
            store.delete(robot_id);
        }
        self.persist_state();
        self.notify(NoticeLevel::Success, format!("Deleted {}", descriptor.name));
        Ok(())
    }

    /// Removes every model. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        for robot_id in self.catalog.active_ids() {
            self.pipeline.deactivate(&robot_id, &mut self.viewer, &mut self.joints);
        }
        let removed = self.catalog.len();
        self.catalog.clear();
        if let Some(store) = &self.store {
            store.clear();
        }
        removed
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        self.notices.drain(..).collect()
    }

    /// Blocks until queued store writes are done.
    pub fn flush_store(&self) {
        if let Some(store) = &self.store {
            store.flush();
        }
    }

    /// Tears down every rig, then the viewer itself.
    pub fn shutdown(&mut self) {
        for robot_id in self.catalog.active_ids() {
            self.pipeline.deactivate(&robot_id, &mut self.viewer, &mut self.joints);
            if let Err(err) = self.catalog.set_state(&robot_id, RigState::Inactive) {
                log::warn!("[session] {err}");
            }
        }
        self.viewer.dispose();
        self.flush_store();
    }

    fn persist_state(&self) {
        if let Some(store) = &self.store {
            store.save_state(AppStateRecord {
                descriptors: self.catalog.references(),
                scene_config: self.viewer.config().clone(),
            });
        }
    }

    fn notify(&mut self, level: NoticeLevel, message: String) {
        match level {
            NoticeLevel::Success => log::info!("[session] {message}"),
            NoticeLevel::Error => log::warn!("[session] {message}"),
        }
        self.notices.push_back(Notice { level, message });
    }

    fn target_robot(&self, robot_id: Option<&str>) -> ViewerResult<String> {
        match robot_id {
            Some(id) => Ok(id.to_string()),
            None => self
                .joints
                .robot_ids()
                .next()
                .map(str::to_string)
                .ok_or_else(|| ViewerError::protocol("No active robot")),
        }
    }
}

impl ViewerCommands for Session {
    fn load_model(&mut self, data: LoadModelData) -> ViewerResult<RobotLoaded> {
        let descriptor = data.into_descriptor()?;
        let descriptor = self.add_descriptor(descriptor)?;
        self.activate(&descriptor.id)
    }

    fn update_joint(&mut self, robot_id: Option<&str>, joint_name: &str, angle: f32) -> ViewerResult<JointUpdate> {
        let robot_id = self.target_robot(robot_id)?;
        self.joints.set_joint_angle(&mut self.viewer, &robot_id, joint_name, angle)
    }

    fn update_joints(&mut self, updates: &[JointTarget]) -> usize {
        self.joints.set_joint_angles(&mut self.viewer, updates)
    }

    fn set_view(&mut self, view: ViewDirection) {
        self.viewer.set_view(view);
    }

    fn joints_snapshot(&self) -> Vec<RobotSnapshot> {
        self.joints.snapshot()
    }

    fn reset_scene(&mut self) {
        self.viewer.reset_scene();
    }

    fn set_joint_mapping(&mut self, robot_id: Option<&str>, aliases: JointAliasMap) -> ViewerResult<()> {
        if let Some(robot_id) = robot_id {
            return self.joints.set_alias_map(robot_id, aliases);
        }
        let robot_ids: Vec<String> = self.joints.robot_ids().map(str::to_string).collect();
        if robot_ids.is_empty() {
            return Err(ViewerError::protocol("No active robot"));
        }
        for robot_id in robot_ids {
            self.joints.set_alias_map(&robot_id, aliases.clone())?;
        }
        Ok(())
    }

    fn set_scene_config(&mut self, patch: &SceneConfigPatch) -> ViewerResult<SceneConfig> {
        let mut config = self.viewer.config().clone();
        config.merge(patch);
        self.viewer.apply_config(config.clone());
        self.persist_state();
        Ok(config)
    }

    fn set_position(&mut self, robot_id: &str, axis: Axis, value: Option<f32>) {
        self.joints.set_position(&mut self.viewer, robot_id, axis, value);
    }

    fn set_rotation(&mut self, robot_id: &str, axis: Axis, degrees: Option<f32>) {
        self.joints.set_rotation(&mut self.viewer, robot_id, axis, degrees);
    }

    fn list_models(&self) -> Vec<ModelSummary> {
        self.catalog
            .entries()
            .map(|entry| ModelSummary {
                id: entry.descriptor.id.clone(),
                name: entry.descriptor.name.clone(),
                state: entry.state,
            })
            .collect()
    }

    fn activate_model(&mut self, robot_id: &str) -> ViewerResult<RobotLoaded> {
        self.activate(robot_id)
    }

    fn deactivate_model(&mut self, robot_id: &str) -> ViewerResult<()> {
        self.deactivate(robot_id)
    }

    fn delete_model(&mut self, robot_id: &str) -> ViewerResult<()> {
        self.delete(robot_id)
    }

    fn clear_models(&mut self) -> usize {
        self.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FileBlob;
    use crate::lifecycle::SharedViewport;
    use crate::renderer::HeadlessRenderer;

    const LAMP: &str = r#"<robot name="lamp">
  <link name="foot"/><link name="arm"/>
  <joint name="hinge" type="revolute"><parent link="foot"/><child link="arm"/><limit lower="-1" upper="1"/></joint>
</robot>"#;

    fn session() -> Session {
        let mut session = Session::new(SceneConfig::default(), ViewerConfig::default());
        session.mount(Box::new(SharedViewport::new(100, 100)), Box::new(HeadlessRenderer::new()));
        session
    }

    fn lamp(id: &str, urdf: &str) -> RobotDescriptor {
        RobotDescriptor::with_id(id, "lamp.urdf", FileBlob::new("lamp.urdf", urdf.as_bytes().to_vec()), [])
    }

    #[test]
    fn notices_follow_upload_activation_and_failure() {
        let mut session = session();
        session.add_descriptor(lamp("l1", LAMP)).expect("add lamp");
        session.activate("l1").expect("activate lamp");
        let notices = session.drain_notices();
        assert_eq!(notices.len(), 2);
        assert!(notices.iter().all(|notice| notice.level == NoticeLevel::Success));
        assert!(session.drain_notices().is_empty());

        session.add_descriptor(RobotDescriptor::with_id(
            "l2",
            "broken.urdf",
            FileBlob::new("broken.urdf", b"<robot".to_vec()),
            [],
        ))
        .expect("add broken lamp");
        session.drain_notices();
        assert!(session.activate("l2").is_err());
        let notices = session.drain_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Error);
        assert_eq!(session.catalog().state("l2"), Some(RigState::Inactive));
    }

    #[test]
    fn joint_mapping_without_robot_id_covers_every_active_robot() {
        let mut session = session();
        assert!(session.set_joint_mapping(None, JointAliasMap::default()).is_err());

        for id in ["l1", "l2"] {
            session.add_descriptor(RobotDescriptor::with_id(
                id,
                format!("{id}.urdf"),
                FileBlob::new(format!("{id}.urdf"), LAMP.as_bytes().to_vec()),
                [],
            ))
            .expect("add lamp");
            session.activate(id).expect("activate");
        }
        let aliases = JointAliasMap::new([("hinge".to_string(), "neck".to_string())]);
        session.set_joint_mapping(None, aliases.clone()).expect("broadcast mapping");
        assert_eq!(session.joints().alias_map("l1"), Some(&aliases));
        assert_eq!(session.joints().alias_map("l2"), Some(&aliases));
    }

    #[test]
    fn deleting_an_active_model_deactivates_it_first() {
        let mut session = session();
        session.add_descriptor(lamp("l1", LAMP)).expect("add lamp");
        session.activate("l1").expect("activate");
        session.delete("l1").expect("delete");
        assert!(session.viewer().rig("l1").is_none());
        assert!(!session.catalog().contains("l1"));
        assert!(matches!(session.delete("l1"), Err(ViewerError::RobotNotFound(_))));
    }

    #[test]
    fn shutdown_marks_active_models_inactive() {
        let mut session = session();
        session.add_descriptor(lamp("l1", LAMP)).expect("add lamp");
        session.activate("l1").expect("activate");
        session.shutdown();
        assert_eq!(session.catalog().state("l1"), Some(RigState::Inactive));
        assert!(!session.joints().is_active("l1"));
        assert!(!session.viewer().is_mounted());
    }
}
