//! The hub: single owner of world, sessions, scheduler, and realm state.
//!
//! Every inbound frame lands in [`Hub::dispatch`]; every session signal lands
//! in the pump started by [`Hub::start_signal_pump`]. Both funnel into the
//! same state behind short-lived locks, so there is exactly one writer for
//! the world at any moment. None of the `parking_lot` locks here are ever
//! held across an await.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use overworld_core::ids::{AgentId, ClientId, SpectatorId};
use overworld_core::paths::check_relative_path;
use overworld_core::process::{template_by_id, ProcessDefinition, ProcessState, ProcessStatus, StageDefinition};
use overworld_core::runtime::{ContentBlock, RuntimeMessage};
use overworld_core::{RpgEvent, RpgEventKind};
use overworld_process::{DelegateError, SchedulerDelegate, StageEvent, StageScheduler};
use overworld_session::findings::{FindingsBoard, Severity};
use overworld_session::{
    AgentRuntime, EventTranslator, ProcessAgentContext, SessionConfig, SessionError,
    SessionManager, SessionStatus, Signal,
};
use overworld_world::{
    AgentStatus, MapObject, NavigationFrame, NavigationState, ObjectKind, Position, TileMap,
    WorldState,
};

use crate::client::{ClientRegistry, ClientRole};
use crate::protocol::{
    ClientMessage, GamePhase, PresenceEntry, RepoStats, ServerMessage, SessionSettings,
    SettingsPatch, SpectatorInfo,
};
use crate::realms::{realm_id_for_path, RealmEntry, RealmRegistry, RealmStats, SnapshotStore};
use crate::worldgen::MapGenerator;

const SAVE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Default template when `player:start-process` names none.
const DEFAULT_PROCESS: &str = "standard_brainstorm";

/// The always-present guide agent spawned into every linked repository.
pub const SEED_AGENT_ID: &str = "oracle";
const SEED_AGENT_NAME: &str = "The Oracle";
const SEED_AGENT_ROLE: &str = "Oracle";

const SEED_MISSION: &str = "Explore this repository and build a working mental model of it. \
Walk the map, read the files behind the objects you encounter, and post findings about \
anything noteworthy. When a player command arrives, answer it before continuing.";

/// Sprite tints handed out cyclically as agents join a realm.
const AGENT_COLORS: [u32; 8] = [
    0x6a8aff, 0x5ae85a, 0xe8c85a, 0xe85a5a, 0xa85ae8, 0xe8985a, 0x5ae8e8, 0xff69b4,
];

/// Navigation bookkeeping for the player console, keyed like an agent.
const PLAYER_NAV_KEY: &str = "player";

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Validation(String),
    #[error("failed to read repository: {0}")]
    Repo(#[from] std::io::Error),
}

/// Descent tracking for every avatar: which room each one is in, and the
/// stack of rooms it came through.
#[derive(Default)]
struct NavTable {
    stacks: HashMap<String, Vec<NavigationFrame>>,
    current_paths: HashMap<String, String>,
}

pub struct HubConfig {
    pub data_dir: PathBuf,
    pub runtime: Arc<dyn AgentRuntime>,
    pub generator: Arc<dyn MapGenerator>,
}

pub struct Hub {
    data_dir: PathBuf,
    registry: Arc<ClientRegistry>,
    sessions: Arc<SessionManager>,
    /// Shared with the session manager; the inner board is swapped whole on
    /// realm switch so both sides see the new realm's findings.
    findings: Arc<AsyncMutex<FindingsBoard>>,
    translator: Mutex<EventTranslator>,
    world: Mutex<WorldState>,
    scheduler: AsyncMutex<Option<Arc<StageScheduler>>>,
    realms: AsyncMutex<RealmRegistry>,
    snapshots: SnapshotStore,
    generator: Arc<dyn MapGenerator>,
    settings: Mutex<SessionSettings>,
    settings_path: PathBuf,
    phase: Mutex<GamePhase>,
    nav: Mutex<NavTable>,
    spectators: Mutex<Vec<SpectatorInfo>>,
    active_realm: Mutex<Option<String>>,
    root: Mutex<Option<PathBuf>>,
    color_index: AtomicUsize,
    port: AtomicU16,
    save_task: Mutex<Option<JoinHandle<()>>>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
}

impl Hub {
    pub async fn new(config: HubConfig, registry: Arc<ClientRegistry>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let findings = Arc::new(AsyncMutex::new(FindingsBoard::new(&config.data_dir)));
        let sessions = Arc::new(SessionManager::new(
            config.runtime,
            Arc::clone(&findings),
            tx,
        ));

        let mut realms = RealmRegistry::new(&config.data_dir);
        realms.load().await;

        let settings_path = config.data_dir.join("settings.json");
        let settings = load_settings(&settings_path).await;

        Arc::new(Self {
            snapshots: SnapshotStore::new(&config.data_dir),
            data_dir: config.data_dir,
            registry,
            sessions,
            findings,
            translator: Mutex::new(EventTranslator::new()),
            world: Mutex::new(WorldState::new()),
            scheduler: AsyncMutex::new(None),
            realms: AsyncMutex::new(realms),
            generator: config.generator,
            settings: Mutex::new(settings),
            settings_path,
            phase: Mutex::new(GamePhase::Onboarding),
            nav: Mutex::new(NavTable::default()),
            spectators: Mutex::new(Vec::new()),
            active_realm: Mutex::new(None),
            root: Mutex::new(None),
            color_index: AtomicUsize::new(0),
            port: AtomicU16::new(0),
            save_task: Mutex::new(None),
            signals: Mutex::new(Some(rx)),
        })
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    /// Drain session signals into world mutations and broadcasts. Call once.
    pub fn start_signal_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let Some(mut rx) = self.signals.lock().take() else {
            return tokio::spawn(async {});
        };
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                hub.handle_signal(signal).await;
            }
        })
    }

    // ── Connection lifecycle ──

    pub fn on_connect(&self, client: &ClientId) {
        let phase = *self.phase.lock();
        self.send(
            client,
            &ServerMessage::ServerInfo {
                port: self.port.load(Ordering::Relaxed),
                game_phase: phase,
                active_realm_id: self.active_realm.lock().clone(),
            },
        );
        if phase == GamePhase::Playing {
            let state = self.world_state_message();
            self.send(client, &state);
        }
    }

    pub async fn on_disconnect(&self, client: &ClientId, role: Option<ClientRole>) {
        match role {
            Some(ClientRole::Spectator(spectator_id)) => {
                self.spectators.lock().retain(|s| s.spectator_id != spectator_id);
                self.broadcast(&ServerMessage::SpectatorLeft { spectator_id });
                tracing::info!(client_id = %client, "spectator disconnected");
            }
            Some(ClientRole::Agent(agent_id)) => {
                self.world.lock().remove_agent(&agent_id);
                self.clear_agent_nav(agent_id.as_str());
                self.broadcast(&ServerMessage::AgentLeft { agent_id });
            }
            _ => {}
        }
    }

    // ── Frame dispatch ──

    pub async fn dispatch(self: &Arc<Self>, client: &ClientId, raw: &str) {
        let message = match ClientMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.send(client, &ServerMessage::error(e.to_string()));
                return;
            }
        };

        let result = match message {
            ClientMessage::AgentRegister { agent_id, name, color } => {
                self.handle_agent_register(client, agent_id, name, color).await
            }
            ClientMessage::LinkRepo { repo_url } => self.handle_link_repo(repo_url).await,
            ClientMessage::StartProcess { problem, process_id } => {
                self.handle_start_process(problem, process_id).await
            }
            ClientMessage::PlayerCommand { text } => self.handle_command(text, None).await,
            ClientMessage::UpdateSettings { settings } => self.handle_update_settings(settings).await,
            ClientMessage::DismissAgent { agent_id } => self.handle_dismiss_agent(agent_id).await,
            ClientMessage::ListRealms => self.handle_list_realms(client).await,
            ClientMessage::ResumeRealm { realm_id } => self.handle_resume_realm(realm_id).await,
            ClientMessage::RemoveRealm { realm_id } => self.handle_remove_realm(client, realm_id).await,
            ClientMessage::NavigateEnter { target_path } => {
                self.handle_player_navigate_enter(client, target_path).await
            }
            ClientMessage::NavigateBack => self.handle_player_navigate_back(client).await,
            ClientMessage::SpectatorRegister { name, color } => {
                self.handle_spectator_register(client, name, color).await
            }
            ClientMessage::SpectatorCommand { name, text } => {
                self.handle_command(text, Some(name)).await
            }
        };

        if let Err(e) = result {
            tracing::warn!(client_id = %client, error = %e, "message handling failed");
            self.send(client, &ServerMessage::error(e.to_string()));
        }
    }

    // ── Signal pump ──

    async fn handle_signal(self: &Arc<Self>, signal: Signal) {
        match signal {
            Signal::Message { agent_id, message } => {
                self.handle_tool_signals(&agent_id, &message).await;
                let events = self.translator.lock().translate(&agent_id, &message);
                for event in events {
                    self.apply_rpg_event(event).await;
                }
            }
            Signal::Complete { agent_id } => {
                let activity = "Task complete, waiting for instructions";
                {
                    let mut world = self.world.lock();
                    world.update_status(&agent_id, AgentStatus::Idle);
                    world.update_activity(&agent_id, activity);
                }
                self.broadcast(&ServerMessage::AgentActivity {
                    agent_id,
                    activity: activity.to_string(),
                });
            }
            Signal::Idle { agent_id } => {
                self.world.lock().update_status(&agent_id, AgentStatus::Idle);
                let scheduler = { self.scheduler.lock().await.clone() };
                if let Some(scheduler) = scheduler {
                    scheduler.on_agent_turn_complete(agent_id.as_str()).await;
                }
                self.schedule_save();
            }
            Signal::Error { agent_id, message } => {
                let activity = format!("Error: {message}");
                {
                    let mut world = self.world.lock();
                    world.update_status(&agent_id, AgentStatus::Stopped);
                    world.update_activity(&agent_id, activity.clone());
                }
                self.broadcast(&ServerMessage::AgentActivity { agent_id, activity });
            }
            Signal::Dismissed { agent_id } => {
                self.world.lock().update_status(&agent_id, AgentStatus::Stopped);
                self.translator.lock().forget(&agent_id);
            }
        }
    }

    /// Runtime tool calls that speak to the hub directly rather than through
    /// the visualization: posting findings and signalling stage completion.
    async fn handle_tool_signals(self: &Arc<Self>, agent_id: &AgentId, message: &RuntimeMessage) {
        let RuntimeMessage::Assistant { message: payload, .. } = message else {
            return;
        };
        for block in &payload.content {
            let ContentBlock::ToolUse { name, input } = block else {
                continue;
            };
            match name.as_str() {
                "PostFindings" => self.post_finding(agent_id, input).await,
                "CompleteStage" => {
                    let artifacts: HashMap<String, String> = input
                        .get("artifacts")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    let scheduler = { self.scheduler.lock().await.clone() };
                    if let Some(scheduler) = scheduler {
                        scheduler.on_explicit_stage_complete(agent_id.as_str(), &artifacts).await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn post_finding(&self, agent_id: &AgentId, input: &Value) {
        let Some(text) = input.get("finding").and_then(|v| v.as_str()) else {
            return;
        };
        let severity_raw = input
            .get("severity")
            .and_then(|v| v.as_str())
            .unwrap_or("medium")
            .to_string();
        let severity = serde_json::from_value::<Severity>(Value::String(severity_raw.clone()))
            .unwrap_or(Severity::Medium);
        let (agent_name, realm) = {
            let world = self.world.lock();
            world
                .agent(agent_id)
                .map(|a| (a.name.clone(), a.realm.clone()))
                .unwrap_or_else(|| (agent_id.as_str().to_string(), String::new()))
        };

        {
            let mut board = self.findings.lock().await;
            board.add(agent_id.clone(), agent_name.clone(), realm.clone(), text, severity);
            board.save().await;
        }

        self.broadcast(&ServerMessage::FindingsPosted {
            agent_id: agent_id.clone(),
            agent_name,
            realm,
            finding: text.to_string(),
            severity: severity_raw,
        });
    }

    async fn apply_rpg_event(self: &Arc<Self>, event: RpgEvent) {
        let agent_id = event.agent_id;
        match event.kind {
            RpgEventKind::Move { x, y } => {
                if !self.world.lock().apply_move(&agent_id, x, y) {
                    return;
                }
                // Stepping onto a door hands the move to navigation instead
                // of echoing it.
                if let Some(nav) = self.nav_object_at(&agent_id, x, y) {
                    match nav.kind {
                        ObjectKind::NavDoor => {
                            if let Some(target) =
                                nav.metadata.get("target_path").and_then(|v| v.as_str())
                            {
                                self.agent_navigate_enter(&agent_id, target).await;
                                return;
                            }
                        }
                        ObjectKind::NavBack => {
                            self.agent_navigate_back(&agent_id).await;
                            return;
                        }
                        _ => {}
                    }
                }
                self.broadcast(&ServerMessage::ActionResult {
                    agent_id,
                    action: "move".into(),
                    params: json!({ "x": x, "y": y }),
                    success: true,
                });
                self.schedule_save();
            }
            RpgEventKind::Speak { text } => {
                self.broadcast(&ServerMessage::ActionResult {
                    agent_id,
                    action: "speak".into(),
                    params: json!({ "text": text }),
                    success: true,
                });
            }
            RpgEventKind::Think { text } => {
                self.broadcast(&ServerMessage::AgentThought { agent_id, text });
            }
            RpgEventKind::Emote { emote } => {
                self.broadcast(&ServerMessage::ActionResult {
                    agent_id,
                    action: "emote".into(),
                    params: json!({ "type": emote }),
                    success: true,
                });
            }
            RpgEventKind::SkillEffect { text } => {
                self.broadcast(&ServerMessage::ActionResult {
                    agent_id,
                    action: "skill".into(),
                    params: json!({ "text": text }),
                    success: true,
                });
            }
            RpgEventKind::Activity { text } => {
                self.world.lock().update_activity(&agent_id, text.clone());
                self.broadcast(&ServerMessage::AgentActivity { agent_id, activity: text });
            }
        }
    }

    // ── Handlers ──

    async fn handle_agent_register(
        &self,
        client: &ClientId,
        agent_id: String,
        name: String,
        color: Option<u32>,
    ) -> Result<(), HubError> {
        let max_agents = self.settings.lock().max_agents;
        if self.world.lock().agents().count() >= max_agents {
            return Err(HubError::Validation(format!(
                "Agent limit reached ({max_agents})"
            )));
        }

        let agent_id = AgentId::from_raw(agent_id);
        let color = color.unwrap_or_else(|| self.next_color());
        let agent = self
            .world
            .lock()
            .add_agent(agent_id.clone(), name, color, "External", "/", None);
        self.registry.set_role(client, ClientRole::Agent(agent_id.clone()));
        {
            let mut nav = self.nav.lock();
            nav.stacks.insert(agent_id.as_str().to_string(), Vec::new());
            nav.current_paths.insert(agent_id.as_str().to_string(), String::new());
        }

        tracing::info!(agent_id = %agent_id, client_id = %client, "external agent registered");
        self.broadcast(&ServerMessage::AgentJoined { agent });
        self.broadcast_world_state();
        Ok(())
    }

    async fn handle_link_repo(self: &Arc<Self>, repo_url: String) -> Result<(), HubError> {
        *self.phase.lock() = GamePhase::Analyzing;
        let result = self.link_repo_inner(repo_url).await;
        *self.phase.lock() = match result {
            Ok(()) => GamePhase::Playing,
            Err(_) => GamePhase::Onboarding,
        };
        result
    }

    async fn link_repo_inner(self: &Arc<Self>, repo_url: String) -> Result<(), HubError> {
        self.teardown_realm().await;

        let root = expand_home(repo_url.trim());
        let root = root
            .canonicalize()
            .map_err(|_| HubError::Validation(format!("No such directory: {}", root.display())))?;
        if !root.is_dir() {
            return Err(HubError::Validation(format!(
                "Not a directory: {}",
                root.display()
            )));
        }

        let tree = self.generator.build_tree(&root)?;
        let repo_name = tree.name.clone();
        let total_files = count_files(&tree);
        tracing::info!(repo = %repo_name, total_files, "repository linked");

        {
            let mut world = self.world.lock();
            *world = WorldState::new();
            world.set_map_tree(tree);
        }
        let (map, objects, _entry) = self
            .ensure_node_map("")
            .ok_or_else(|| HubError::Validation("Repository tree is empty".into()))?;
        {
            let mut world = self.world.lock();
            world.set_map(map.clone());
            world.set_objects(objects.clone());
        }
        self.translator.lock().set_objects(objects.clone());

        {
            let mut board = FindingsBoard::new(&root);
            board.load().await;
            *self.findings.lock().await = board;
        }

        let realm_id = realm_id_for_path(&root.to_string_lossy());
        *self.root.lock() = Some(root.clone());
        *self.active_realm.lock() = Some(realm_id.clone());
        {
            let mut realms = self.realms.lock().await;
            realms.upsert(RealmEntry {
                id: realm_id.clone(),
                path: root.display().to_string(),
                name: repo_name.clone(),
                last_explored: Utc::now(),
                stats: RealmStats {
                    total_files,
                    ..RealmStats::default()
                },
            });
            realms.set_last_active(Some(realm_id));
            realms.save().await;
        }

        self.broadcast(&ServerMessage::RepoReady {
            repo_name,
            map,
            quests: Vec::new(),
            objects,
            stats: RepoStats { total_files, languages: Vec::new() },
        });

        self.spawn_seed_agent(&root).await?;
        self.execute_save().await;
        Ok(())
    }

    async fn handle_start_process(
        self: &Arc<Self>,
        problem: String,
        process_id: Option<String>,
    ) -> Result<(), HubError> {
        *self.phase.lock() = GamePhase::Analyzing;
        let result = self.start_process_inner(problem, process_id).await;
        *self.phase.lock() = match result {
            Ok(()) => GamePhase::Playing,
            Err(_) => GamePhase::Onboarding,
        };
        result
    }

    async fn start_process_inner(
        self: &Arc<Self>,
        problem: String,
        process_id: Option<String>,
    ) -> Result<(), HubError> {
        let template_id = process_id.as_deref().unwrap_or(DEFAULT_PROCESS);
        let template = template_by_id(template_id)
            .ok_or_else(|| HubError::Validation(format!("Unknown process template: {template_id}")))?;
        let first_stage = template
            .stages
            .first()
            .cloned()
            .ok_or_else(|| HubError::Validation(format!("Template {template_id} has no stages")))?;

        self.teardown_realm().await;

        // Process realms run out of the data directory; there is no repo.
        let root = self.data_dir.clone();
        let realm_id = format!("process_{}", Utc::now().timestamp_millis());
        {
            let mut world = self.world.lock();
            *world = WorldState::new();
            world.set_process(ProcessState::new(&template.id, &problem));
        }
        self.translator.lock().set_objects(Vec::new());
        {
            let mut board = FindingsBoard::new(&root);
            board.load().await;
            *self.findings.lock().await = board;
        }
        *self.root.lock() = Some(root);
        *self.active_realm.lock() = Some(realm_id);
        {
            let mut realms = self.realms.lock().await;
            realms.set_last_active(self.active_realm.lock().clone());
            realms.save().await;
        }

        self.broadcast(&ServerMessage::ProcessStarted {
            process_id: template.id.clone(),
            process_name: template.name.clone(),
            problem: problem.clone(),
            current_stage_id: first_stage.id.clone(),
            current_stage_name: first_stage.name.clone(),
            total_stages: template.stages.len(),
        });

        let scheduler = Arc::new(StageScheduler::new(Arc::new(HubDelegate {
            hub: Arc::downgrade(self),
        })));
        *self.scheduler.lock().await = Some(Arc::clone(&scheduler));

        self.spawn_stage_agents(&template, 0, &problem, false)
            .await
            .map_err(|e| HubError::Validation(e.to_string()))?;
        scheduler.start(&problem, template).await;

        self.schedule_save();
        Ok(())
    }

    /// Route a command to the agent whose name prefixes it, defaulting to the
    /// seed agent. Spectator commands carry the spectator's name.
    async fn handle_command(&self, text: String, from: Option<String>) -> Result<(), HubError> {
        let active = self.sessions.active_ids();
        if active.is_empty() {
            return Err(HubError::Validation("No active agents to command".into()));
        }

        let lower = text.to_lowercase();
        let mut target = AgentId::from_raw(SEED_AGENT_ID);
        {
            let world = self.world.lock();
            for id in &active {
                if let Some(agent) = world.agent(id) {
                    let name = agent.name.to_lowercase();
                    if lower.starts_with(&format!("{name},")) || lower.starts_with(&format!("{name} ")) {
                        target = id.clone();
                        break;
                    }
                }
            }
        }
        if !active.contains(&target) {
            // No seed agent in process realms; fall back to any roster member.
            target = active[0].clone();
        }

        let prompt = match &from {
            Some(name) => format!("[PLAYER COMMAND from {name}]: {text}"),
            None => format!("[PLAYER COMMAND]: {text}"),
        };

        let busy = matches!(
            self.sessions.status(&target).await,
            Some(SessionStatus::Starting | SessionStatus::Running)
        );
        if busy {
            self.broadcast(&ServerMessage::AgentActivity {
                agent_id: target.clone(),
                activity: "Busy, your command is queued and will be delivered when ready".into(),
            });
        }

        self.sessions.follow_up(&target, prompt).await?;
        Ok(())
    }

    async fn handle_update_settings(&self, patch: SettingsPatch) -> Result<(), HubError> {
        let snapshot = {
            let mut settings = self.settings.lock();
            settings.merge(&patch);
            settings.clone()
        };
        save_settings(&self.settings_path, &snapshot).await;
        tracing::info!(
            max_agents = snapshot.max_agents,
            "settings updated"
        );
        Ok(())
    }

    async fn handle_dismiss_agent(self: &Arc<Self>, agent_id: String) -> Result<(), HubError> {
        let agent_id = AgentId::from_raw(agent_id);
        self.sessions.dismiss(&agent_id).await;
        self.world.lock().remove_agent(&agent_id);
        self.clear_agent_nav(agent_id.as_str());
        self.broadcast(&ServerMessage::AgentLeft { agent_id });
        self.schedule_save();
        Ok(())
    }

    async fn handle_list_realms(&self, client: &ClientId) -> Result<(), HubError> {
        let realms = self.realms.lock().await.list();
        self.send(client, &ServerMessage::RealmList { realms });
        Ok(())
    }

    async fn handle_resume_realm(self: &Arc<Self>, realm_id: String) -> Result<(), HubError> {
        *self.phase.lock() = GamePhase::Analyzing;
        let result = self.resume_realm_inner(realm_id).await;
        *self.phase.lock() = match result {
            Ok(()) => GamePhase::Playing,
            Err(_) => GamePhase::Onboarding,
        };
        result
    }

    async fn resume_realm_inner(self: &Arc<Self>, realm_id: String) -> Result<(), HubError> {
        let entry = self
            .realms
            .lock()
            .await
            .get(&realm_id)
            .cloned()
            .ok_or_else(|| HubError::Validation(format!("Realm \"{realm_id}\" not found")))?;

        self.teardown_realm().await;

        let saved = self.snapshots.load(&realm_id).await.ok_or_else(|| {
            HubError::Validation("No saved state for this realm; link it again to re-scan".into())
        })?;
        let root = PathBuf::from(&entry.path);

        let nav_state = saved.navigation().cloned();
        let objects = saved.objects().to_vec();
        *self.world.lock() = saved;
        if let Some(nav_state) = nav_state {
            let mut nav = self.nav.lock();
            nav.stacks = nav_state.stacks;
            nav.current_paths = nav_state.current_paths;
        }
        self.translator.lock().set_objects(objects);

        {
            let mut board = FindingsBoard::new(&root);
            board.load().await;
            *self.findings.lock().await = board;
        }
        *self.root.lock() = Some(root.clone());
        *self.active_realm.lock() = Some(realm_id.clone());
        {
            let mut realms = self.realms.lock().await;
            let mut refreshed = entry.clone();
            refreshed.last_explored = Utc::now();
            realms.upsert(refreshed);
            realms.set_last_active(Some(realm_id.clone()));
            realms.save().await;
        }

        let snapshot = self.world.lock().snapshot();
        self.broadcast(&ServerMessage::RepoReady {
            repo_name: entry.name.clone(),
            map: snapshot.map,
            quests: snapshot.quests,
            objects: snapshot.objects,
            stats: RepoStats {
                total_files: entry.stats.total_files,
                languages: entry.stats.languages.clone(),
            },
        });

        let process = self.world.lock().process().cloned();
        match process {
            Some(state) if state.status == ProcessStatus::Running => {
                match template_by_id(&state.process_id) {
                    Some(template) => self.resume_process(&state, template).await?,
                    None => {
                        // Snapshot written by a build with templates we no
                        // longer ship; degrade to plain exploration.
                        tracing::warn!(
                            process_id = %state.process_id,
                            "unknown process template in snapshot, spawning seed agent instead"
                        );
                        self.spawn_seed_agent(&root).await?;
                    }
                }
            }
            _ => self.spawn_seed_agent(&root).await?,
        }

        tracing::info!(realm_id = %realm_id, "realm resumed");
        Ok(())
    }

    /// Rebuild the scheduler from persisted counters without restarting the
    /// process, then respawn the current stage's roster flagged as resumed.
    async fn resume_process(
        self: &Arc<Self>,
        state: &ProcessState,
        template: ProcessDefinition,
    ) -> Result<(), HubError> {
        let scheduler = Arc::new(StageScheduler::restore(
            Arc::new(HubDelegate { hub: Arc::downgrade(self) }),
            state,
            template.clone(),
        ));
        *self.scheduler.lock().await = Some(scheduler);

        let stage = template.stage(state.current_stage_index);
        self.broadcast(&ServerMessage::ProcessStarted {
            process_id: template.id.clone(),
            process_name: template.name.clone(),
            problem: state.problem.clone(),
            current_stage_id: stage.map(|s| s.id.clone()).unwrap_or_default(),
            current_stage_name: stage.map(|s| s.name.clone()).unwrap_or_default(),
            total_stages: template.stages.len(),
        });

        self.spawn_stage_agents(&template, state.current_stage_index, &state.problem, true)
            .await
            .map_err(|e| HubError::Validation(e.to_string()))?;
        Ok(())
    }

    async fn handle_remove_realm(&self, client: &ClientId, realm_id: String) -> Result<(), HubError> {
        {
            let mut realms = self.realms.lock().await;
            if realms.last_active() == Some(realm_id.as_str()) {
                realms.set_last_active(None);
            }
            realms.remove(&realm_id);
            realms.save().await;
        }
        self.snapshots.remove(&realm_id).await;
        self.send(client, &ServerMessage::RealmRemoved { realm_id });
        Ok(())
    }

    // ── Player navigation ──

    async fn handle_player_navigate_enter(
        self: &Arc<Self>,
        client: &ClientId,
        target_path: String,
    ) -> Result<(), HubError> {
        if *self.phase.lock() != GamePhase::Playing {
            return Err(HubError::Validation("No active realm".into()));
        }
        check_relative_path(&target_path).map_err(|e| HubError::Validation(e.to_string()))?;
        let (map, objects, entry) = self
            .ensure_node_map(&target_path)
            .ok_or_else(|| HubError::Validation(format!("No such folder: {target_path}")))?;

        {
            let mut nav = self.nav.lock();
            let previous = nav
                .current_paths
                .get(PLAYER_NAV_KEY)
                .cloned()
                .unwrap_or_default();
            let breadcrumb = self.node_entry(&previous).unwrap_or(Position { x: 1, y: 1 });
            nav.stacks
                .entry(PLAYER_NAV_KEY.into())
                .or_default()
                .push(NavigationFrame { path: previous, return_position: breadcrumb });
            nav.current_paths.insert(PLAYER_NAV_KEY.into(), target_path.clone());
        }

        self.send(
            client,
            &ServerMessage::MapChange {
                path: target_path,
                map,
                objects,
                position: entry,
                breadcrumb: entry,
            },
        );
        self.broadcast_presence();
        Ok(())
    }

    async fn handle_player_navigate_back(self: &Arc<Self>, client: &ClientId) -> Result<(), HubError> {
        let frame = {
            let nav = self.nav.lock();
            nav.stacks.get(PLAYER_NAV_KEY).and_then(|s| s.last().cloned())
        };
        let frame = frame.ok_or_else(|| HubError::Validation("Already at the repository root".into()))?;
        let (map, objects, _entry) = self
            .ensure_node_map(&frame.path)
            .ok_or_else(|| HubError::Validation("Parent room no longer exists".into()))?;

        {
            let mut nav = self.nav.lock();
            if let Some(stack) = nav.stacks.get_mut(PLAYER_NAV_KEY) {
                stack.pop();
            }
            nav.current_paths.insert(PLAYER_NAV_KEY.into(), frame.path.clone());
        }

        self.send(
            client,
            &ServerMessage::MapChange {
                path: frame.path,
                map,
                objects,
                position: frame.return_position,
                breadcrumb: frame.return_position,
            },
        );
        self.broadcast_presence();
        Ok(())
    }

    // ── Spectators ──

    async fn handle_spectator_register(
        &self,
        client: &ClientId,
        name: String,
        color: Option<u32>,
    ) -> Result<(), HubError> {
        if let Some(ClientRole::Spectator(spectator_id)) = self.registry.role(client) {
            // Same socket registering twice: repeat the welcome.
            let name = self
                .spectators
                .lock()
                .iter()
                .find(|s| s.spectator_id == spectator_id)
                .map(|s| s.name.clone())
                .unwrap_or(name);
            self.send(client, &ServerMessage::SpectatorWelcome { spectator_id, name });
            return Ok(());
        }

        let spectator_id = SpectatorId::new();
        let name: String = name.chars().take(30).collect();
        self.spectators.lock().push(SpectatorInfo {
            spectator_id: spectator_id.clone(),
            name: name.clone(),
            color,
        });
        self.registry.set_role(client, ClientRole::Spectator(spectator_id.clone()));

        tracing::info!(client_id = %client, name = %name, "spectator registered");
        self.send(
            client,
            &ServerMessage::SpectatorWelcome {
                spectator_id: spectator_id.clone(),
                name: name.clone(),
            },
        );
        self.broadcast(&ServerMessage::SpectatorJoined { spectator_id, name, color });
        if *self.phase.lock() == GamePhase::Playing {
            let state = self.world_state_message();
            self.send(client, &state);
        }
        Ok(())
    }

    // ── Agent spawning ──

    async fn spawn_seed_agent(self: &Arc<Self>, root: &Path) -> Result<(), HubError> {
        let agent_id = AgentId::from_raw(SEED_AGENT_ID);
        let color = self.next_color();
        let agent = self.world.lock().add_agent(
            agent_id.clone(),
            SEED_AGENT_NAME,
            color,
            SEED_AGENT_ROLE,
            "/",
            None,
        );
        {
            let mut nav = self.nav.lock();
            nav.stacks.insert(SEED_AGENT_ID.into(), Vec::new());
            nav.current_paths.insert(SEED_AGENT_ID.into(), String::new());
        }
        self.broadcast(&ServerMessage::AgentJoined { agent });
        self.broadcast_world_state();

        let permissions = self.settings.lock().permission_level.tier();
        self.sessions
            .spawn(SessionConfig {
                agent_id,
                agent_name: SEED_AGENT_NAME.into(),
                role: SEED_AGENT_ROLE.into(),
                realm: "/".into(),
                mission: SEED_MISSION.into(),
                root: root.to_path_buf(),
                permissions,
                process: None,
            })
            .await?;
        Ok(())
    }

    /// Spawn one session per role in the given stage, placing an avatar for
    /// each. Shared between process start, stage advancement, and resume.
    pub(crate) async fn spawn_stage_agents(
        self: &Arc<Self>,
        template: &ProcessDefinition,
        stage_index: usize,
        problem: &str,
        resumed: bool,
    ) -> Result<(), DelegateError> {
        let Some(stage) = template.stage(stage_index).cloned() else {
            return Ok(());
        };
        let root = self
            .root
            .lock()
            .clone()
            .unwrap_or_else(|| self.data_dir.clone());
        let prior_artifacts = self
            .world
            .lock()
            .process()
            .map(|p| p.collected_artifacts.clone())
            .unwrap_or_default();
        let permissions = self.settings.lock().permission_level.tier();

        for role_id in &stage.roles {
            let role = template
                .role(role_id)
                .ok_or_else(|| DelegateError(format!("unknown role: {role_id}")))?;
            let color = role
                .color
                .as_deref()
                .and_then(parse_hex_color)
                .unwrap_or_else(|| self.next_color());
            let agent = self.world.lock().add_agent(
                AgentId::from_raw(role_id.clone()),
                role.name.clone(),
                color,
                role.name.clone(),
                "/",
                None,
            );
            self.broadcast(&ServerMessage::AgentJoined { agent });
        }
        self.broadcast_world_state();

        for role_id in &stage.roles {
            let role = template
                .role(role_id)
                .ok_or_else(|| DelegateError(format!("unknown role: {role_id}")))?;
            self.sessions
                .spawn(SessionConfig {
                    agent_id: AgentId::from_raw(role_id.clone()),
                    agent_name: role.name.clone(),
                    role: role.name.clone(),
                    realm: "/".into(),
                    mission: format!(
                        "Participate in the \"{}\" stage of this process. Use PostFindings to \
                         share your contributions with the group.",
                        stage.name
                    ),
                    root: root.clone(),
                    permissions,
                    process: Some(ProcessAgentContext {
                        problem: problem.to_string(),
                        process_name: template.name.clone(),
                        stage_id: stage.id.clone(),
                        stage_name: stage.name.clone(),
                        stage_goal: stage.goal.clone(),
                        stage_index,
                        total_stages: template.stages.len(),
                        persona: role.persona.clone(),
                        prior_artifacts: prior_artifacts.clone(),
                        resumed,
                    }),
                })
                .await
                .map_err(|e| DelegateError(e.to_string()))?;
        }
        Ok(())
    }

    // ── Agent navigation ──

    /// A nav object on the given tile of the room the agent currently stands
    /// in, if any.
    fn nav_object_at(&self, agent_id: &AgentId, x: u32, y: u32) -> Option<MapObject> {
        let current_path = self
            .nav
            .lock()
            .current_paths
            .get(agent_id.as_str())
            .cloned()
            .unwrap_or_default();
        let world = self.world.lock();
        let objects: Vec<MapObject> = match world
            .map_node(&current_path)
            .and_then(|n| n.objects.clone())
        {
            Some(objects) => objects,
            None => world.objects().to_vec(),
        };
        objects.into_iter().find(|o| {
            o.x == x && o.y == y && matches!(o.kind, ObjectKind::NavDoor | ObjectKind::NavBack)
        })
    }

    async fn agent_navigate_enter(self: &Arc<Self>, agent_id: &AgentId, target_path: &str) {
        if let Err(e) = check_relative_path(target_path) {
            tracing::warn!(agent_id = %agent_id, error = %e, "agent navigation rejected");
            return;
        }
        let Some((map, objects, entry)) = self.ensure_node_map(target_path) else {
            return;
        };

        let key = agent_id.as_str().to_string();
        let return_position = self
            .world
            .lock()
            .agent(agent_id)
            .map(|a| Position { x: a.x, y: a.y })
            .unwrap_or(Position { x: 1, y: 1 });
        {
            let mut nav = self.nav.lock();
            let previous = nav.current_paths.get(&key).cloned().unwrap_or_default();
            nav.stacks
                .entry(key.clone())
                .or_default()
                .push(NavigationFrame { path: previous, return_position });
            nav.current_paths.insert(key, target_path.to_string());
        }
        self.world.lock().apply_move(agent_id, entry.x, entry.y);

        // Internal agents have no socket of their own; only externally
        // registered ones get the room pushed to them.
        if let Some(client) = self.registry.client_for_agent(agent_id) {
            self.send(
                &client,
                &ServerMessage::MapChange {
                    path: target_path.to_string(),
                    map,
                    objects,
                    position: entry,
                    breadcrumb: entry,
                },
            );
        }
        self.broadcast_presence();
        self.schedule_save();
    }

    async fn agent_navigate_back(self: &Arc<Self>, agent_id: &AgentId) {
        let key = agent_id.as_str().to_string();
        let frame = {
            let nav = self.nav.lock();
            nav.stacks.get(&key).and_then(|s| s.last().cloned())
        };
        let Some(frame) = frame else {
            return; // already at the root
        };
        let Some((map, objects, _entry)) = self.ensure_node_map(&frame.path) else {
            return;
        };

        {
            let mut nav = self.nav.lock();
            if let Some(stack) = nav.stacks.get_mut(&key) {
                stack.pop();
            }
            nav.current_paths.insert(key, frame.path.clone());
        }
        self.world
            .lock()
            .apply_move(agent_id, frame.return_position.x, frame.return_position.y);

        if let Some(client) = self.registry.client_for_agent(agent_id) {
            self.send(
                &client,
                &ServerMessage::MapChange {
                    path: frame.path.clone(),
                    map,
                    objects,
                    position: frame.return_position,
                    breadcrumb: frame.return_position,
                },
            );
        }
        self.broadcast_presence();
        self.schedule_save();
    }

    /// Resolve a node and generate its map on first visit; the generated map
    /// is cached in the tree so revisits are free and deterministic.
    fn ensure_node_map(&self, path: &str) -> Option<(TileMap, Vec<MapObject>, Position)> {
        let mut world = self.world.lock();
        let tree = world.map_tree_mut()?;
        let node = tree.resolve_mut(path)?;
        if node.map.is_none() {
            let generated = self.generator.generate_node_map(node);
            node.map = Some(generated.map);
            node.objects = Some(generated.objects);
            node.entry_position = Some(generated.entry_position);
        }
        let map = node.map.clone()?;
        let objects = node.objects.clone().unwrap_or_default();
        let entry = node
            .entry_position
            .unwrap_or(Position { x: map.width / 2, y: 2 });
        Some((map, objects, entry))
    }

    fn node_entry(&self, path: &str) -> Option<Position> {
        self.world.lock().map_node(path)?.entry_position
    }

    fn clear_agent_nav(&self, key: &str) {
        let mut nav = self.nav.lock();
        nav.stacks.remove(key);
        nav.current_paths.remove(key);
    }

    fn broadcast_presence(&self) {
        let players: Vec<PresenceEntry> = {
            let nav = self.nav.lock();
            let world = self.world.lock();
            nav.current_paths
                .iter()
                .filter(|(key, _)| key.as_str() != PLAYER_NAV_KEY)
                .map(|(id, path)| PresenceEntry {
                    id: id.clone(),
                    name: world
                        .agent(&AgentId::from_raw(id.clone()))
                        .map(|a| a.name.clone())
                        .unwrap_or_else(|| id.clone()),
                    path: path.clone(),
                    depth: if path.is_empty() { 0 } else { path.split('/').count() },
                })
                .collect()
        };
        self.broadcast(&ServerMessage::RealmPresence { players });
    }

    // ── Persistence ──

    /// Debounced snapshot: frequent world mutations collapse into one disk
    /// write per second.
    fn schedule_save(self: &Arc<Self>) {
        if self.active_realm.lock().is_none() {
            return;
        }
        let hub = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(SAVE_DEBOUNCE).await;
            hub.execute_save().await;
        });
        if let Some(previous) = self.save_task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn execute_save(&self) {
        let Some(realm_id) = self.active_realm.lock().clone() else {
            return;
        };
        let scheduler = { self.scheduler.lock().await.clone() };
        let nav_state = {
            let nav = self.nav.lock();
            NavigationState {
                stacks: nav.stacks.clone(),
                current_paths: nav.current_paths.clone(),
            }
        };
        let world = {
            let mut world = self.world.lock();
            if let Some(scheduler) = &scheduler {
                if let Some(mut state) = world.process().cloned() {
                    scheduler.snapshot_into(&mut state);
                    world.set_process(state);
                }
            }
            world.set_navigation(nav_state);
            world.clone()
        };
        if let Err(e) = self.snapshots.save(&realm_id, &world).await {
            tracing::warn!(realm_id = %realm_id, error = %e, "world snapshot failed");
        }
    }

    /// Cancel any pending debounce and write immediately.
    pub async fn force_save(&self) {
        if let Some(task) = self.save_task.lock().take() {
            task.abort();
        }
        self.execute_save().await;
    }

    /// Graceful shutdown: persist, forget the active realm, stop everything.
    pub async fn shutdown(&self) {
        self.force_save().await;
        {
            let mut realms = self.realms.lock().await;
            realms.set_last_active(None);
            realms.save().await;
        }
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop();
        }
        self.sessions.dismiss_all().await;
        tracing::info!("hub shut down");
    }

    async fn teardown_realm(&self) {
        if let Some(scheduler) = self.scheduler.lock().await.take() {
            scheduler.stop();
        }
        for agent_id in self.sessions.active_ids() {
            self.sessions.dismiss(&agent_id).await;
            self.world.lock().remove_agent(&agent_id);
        }
        {
            let mut nav = self.nav.lock();
            nav.stacks.clear();
            nav.current_paths.clear();
        }
        self.color_index.store(0, Ordering::Relaxed);
        if let Some(task) = self.save_task.lock().take() {
            task.abort();
        }
        *self.active_realm.lock() = None;
        *self.root.lock() = None;
    }

    // ── Small helpers ──

    fn next_color(&self) -> u32 {
        let index = self.color_index.fetch_add(1, Ordering::Relaxed);
        AGENT_COLORS[index % AGENT_COLORS.len()]
    }

    fn world_state_message(&self) -> ServerMessage {
        let snapshot = self.world.lock().snapshot();
        let spectators = self.spectators.lock().clone();
        ServerMessage::WorldState { snapshot, spectators }
    }

    fn broadcast_world_state(&self) {
        let message = self.world_state_message();
        self.broadcast(&message);
    }

    fn send(&self, client: &ClientId, message: &ServerMessage) {
        self.registry.send_to(client, message.to_json());
    }

    fn broadcast(&self, message: &ServerMessage) {
        self.registry.broadcast(&message.to_json());
    }
}

/// Scheduler callbacks routed back into the hub. Holds a weak reference so a
/// stale scheduler cannot keep a torn-down hub alive.
struct HubDelegate {
    hub: Weak<Hub>,
}

#[async_trait]
impl SchedulerDelegate for HubDelegate {
    async fn dismiss_stage_agents(&self, stage: &StageDefinition) -> Result<(), DelegateError> {
        let Some(hub) = self.hub.upgrade() else {
            return Ok(());
        };
        for role_id in &stage.roles {
            let agent_id = AgentId::from_raw(role_id.clone());
            hub.sessions.dismiss(&agent_id).await;
            hub.world.lock().remove_agent(&agent_id);
            hub.clear_agent_nav(agent_id.as_str());
            hub.broadcast(&ServerMessage::AgentLeft { agent_id });
        }
        hub.schedule_save();
        Ok(())
    }

    async fn spawn_stage_agents(
        &self,
        template: &ProcessDefinition,
        stage_index: usize,
        problem: &str,
    ) -> Result<(), DelegateError> {
        let Some(hub) = self.hub.upgrade() else {
            return Ok(());
        };
        hub.spawn_stage_agents(template, stage_index, problem, false).await?;
        hub.schedule_save();
        Ok(())
    }

    async fn broadcast(&self, event: StageEvent) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        hub.broadcast(&stage_event_message(event));
    }

    async fn save_artifact(&self, stage_id: &str, artifact_id: &str, content: &str) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        hub.world
            .lock()
            .set_artifact(stage_id, artifact_id, content.to_string());
        hub.schedule_save();
    }

    async fn stage_advanced(&self, completed_stage_id: &str) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        hub.world.lock().advance_stage(completed_stage_id, &HashMap::new());
        hub.schedule_save();
    }

    async fn process_completed(&self, final_stage_id: &str) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        hub.world.lock().complete_process(final_stage_id, &HashMap::new());
        hub.schedule_save();
    }

    async fn follow_up(&self, agent_id: &str, prompt: &str) -> Result<(), DelegateError> {
        let Some(hub) = self.hub.upgrade() else {
            return Ok(());
        };
        hub.sessions
            .follow_up(&AgentId::from_raw(agent_id), prompt.to_string())
            .await
            .map_err(|e| DelegateError(e.to_string()))
    }
}

fn stage_event_message(event: StageEvent) -> ServerMessage {
    match event {
        StageEvent::StageStarted { stage_id, stage_name, stage_index, total_stages } => {
            ServerMessage::StageStarted { stage_id, stage_name, stage_index, total_stages }
        }
        StageEvent::StageAdvanced {
            from_stage_id,
            from_stage_name,
            to_stage_id,
            to_stage_name,
            stage_index,
            total_stages,
        } => ServerMessage::StageAdvanced {
            from_stage_id,
            from_stage_name,
            to_stage_id,
            to_stage_name,
            stage_index,
            total_stages,
        },
        StageEvent::ProcessCompleted { process_id, problem } => {
            ServerMessage::ProcessCompleted { process_id, problem }
        }
        StageEvent::Error { message } => ServerMessage::Error { message },
    }
}

fn parse_hex_color(raw: &str) -> Option<u32> {
    u32::from_str_radix(raw.trim_start_matches('#'), 16).ok()
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest.trim_start_matches('/'));
        }
    }
    PathBuf::from(raw)
}

fn count_files(node: &overworld_world::MapNode) -> usize {
    let own = match node.kind {
        overworld_world::MapNodeKind::File => 1,
        overworld_world::MapNodeKind::Folder => 0,
    };
    own + node.children.iter().map(count_files).sum::<usize>()
}

async fn load_settings(path: &Path) -> SessionSettings {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "corrupt settings file, using defaults");
            SessionSettings::default()
        }),
        Err(_) => SessionSettings::default(),
    }
}

async fn save_settings(path: &Path, settings: &SessionSettings) {
    let Ok(json) = serde_json::to_string_pretty(settings) else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Err(e) = tokio::fs::write(path, json).await {
        tracing::warn!(path = %path.display(), error = %e, "settings save failed");
    }
}
