//! C6 — per-robot session: motors, players, telemetry ingestion, logging.
//!
//! Grounded on `EDMOSession.py`'s `EDMOSession`/`EDMOPlayer`. All mutable
//! session state lives behind a single `tokio::sync::Mutex` — one lock per
//! unit of concurrency, not one per field, matching the "single mutex per
//! session" policy spec.md §5 mandates.

pub mod sweep;

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::codec::{self, Command, Instruction};
use crate::error::{BackendError, Result};
use crate::imu;
use crate::logger::{self, SessionLogger};
use crate::motor::{self, Motor, MotorState};
use crate::player::channel::{ChannelEvent, PlayerChannel};
use crate::transport::FusedLink;

struct PlayerRecord {
    id: u64,
    name: String,
    number: Option<u8>,
    voted: bool,
    channel: Arc<dyn PlayerChannel>,
}

#[derive(Debug, Serialize)]
pub struct PlayerSummary {
    pub number: u8,
    pub name: String,
    pub voted: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    #[serde(rename = "Title")]
    pub title: String,
    #[serde(rename = "Value")]
    pub value: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionInfo {
    #[serde(rename = "robotID")]
    pub robot_id: String,
    pub names: Vec<String>,
    #[serde(rename = "HelpNumber")]
    pub help_number: usize,
}

#[derive(Debug, Serialize)]
pub struct DetailedPlayerInfo {
    pub name: String,
    #[serde(rename = "HelpRequested")]
    pub help_requested: bool,
}

#[derive(Debug, Serialize)]
pub struct DetailedInfo {
    #[serde(rename = "robotID")]
    pub robot_id: String,
    pub players: Vec<DetailedPlayerInfo>,
    pub tasks: Vec<TaskSummary>,
    #[serde(rename = "helpEnabled")]
    pub help_enabled: bool,
}

struct SessionState {
    motors: Vec<Motor>,
    motor_current: Vec<Option<MotorState>>,
    motor_previous: Vec<Option<MotorState>>,
    free_numbers: BinaryHeap<Reverse<u8>>,
    active: Vec<PlayerRecord>,
    waiting: Vec<PlayerRecord>,
    next_player_id: u64,
    offset_time: u32,
    help_enabled: bool,
    simple_mode: bool,
    tasks: BTreeMap<String, bool>,
    logger: Option<SessionLogger>,
    sweep_detectors: HashMap<u8, sweep::SweepDetector>,
    sweep_watchers: HashMap<u8, Arc<Notify>>,
}

/// One live control session bound to a single identified robot.
///
/// Spec §4.6's "session announces itself removable" when its last player
/// calls `onClosed` is implemented as a poll rather than a push: the
/// backend checks `has_players()` on every tick (`remove_empty_sessions`)
/// instead of this type owning a notification channel back to the
/// registry. Simpler, and the 40 Hz tick already visits every session.
pub struct Session {
    identity: String,
    link: Arc<FusedLink>,
    log_root: PathBuf,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(
        identity: String,
        link: Arc<FusedLink>,
        motor_count: usize,
        log_root: PathBuf,
    ) -> Arc<Self> {
        let motors = (0..motor_count).map(|i| Motor::new(i as u8)).collect();
        // One slot number per motor (spec §3 invariant ii: |active| +
        // |freeSlots| = N, N being the motor count, not a fixed lobby size).
        let free_numbers = (0..motor_count as u8).map(Reverse).collect();

        let state = SessionState {
            motors,
            motor_current: vec![None; motor_count],
            motor_previous: vec![None; motor_count],
            free_numbers,
            active: Vec::new(),
            waiting: Vec::new(),
            next_player_id: 0,
            offset_time: 0,
            help_enabled: false,
            simple_mode: true,
            tasks: BTreeMap::new(),
            logger: None,
            sweep_detectors: HashMap::new(),
            sweep_watchers: HashMap::new(),
        };

        Arc::new(Session {
            identity,
            link,
            log_root,
            state: Mutex::new(state),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Re-synchronizes the robot's session clock. Called on session
    /// creation and whenever the fused link reports a reconnection.
    pub async fn on_edmo_reconnect(&self) {
        let offset_time = self.state.lock().await.offset_time;
        self.write_session_start(offset_time);
    }

    fn write_session_start(&self, offset_time: u32) {
        self.link
            .write(&codec::create(Instruction::SessionStart, &offset_time.to_le_bytes()));
    }

    pub async fn reset(&self) {
        self.on_edmo_reconnect().await;
    }

    pub async fn has_players(&self) -> bool {
        let state = self.state.lock().await;
        !state.active.is_empty() || !state.waiting.is_empty()
    }

    // ---- player admission (spec §4.6) ----------------------------------

    /// Registers a not-yet-connected player. Returns `Err(SessionFull)`
    /// when every motor slot number is already held by an active player.
    /// Spawns the task that pumps the channel's lifecycle/message events
    /// back into this session for as long as the channel lives.
    pub async fn register_player(
        self: &Arc<Self>,
        mut channel: Box<dyn PlayerChannel>,
        name: String,
    ) -> Result<()> {
        let events = channel.take_events();
        let channel: Arc<dyn PlayerChannel> = Arc::from(channel);

        let mut state = self.state.lock().await;
        if state.free_numbers.is_empty() {
            return Err(BackendError::SessionFull {
                identity: self.identity.clone(),
            });
        }

        let id = state.next_player_id;
        state.next_player_id += 1;
        state.waiting.push(PlayerRecord {
            id,
            name,
            number: None,
            voted: false,
            channel,
        });
        drop(state);

        let session = self.clone();
        tokio::spawn(async move { session.pump_player_events(id, events).await });

        Ok(())
    }

    /// The single dispatcher every `PlayerChannel` implementor's events
    /// funnel through — including the reserved `"CLOSE"` inbound message
    /// (spec §4.7), handled once here rather than by each implementation.
    async fn pump_player_events(
        self: Arc<Self>,
        id: u64,
        mut events: tokio::sync::mpsc::Receiver<ChannelEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Connected => self.player_connected(id).await,
                ChannelEvent::Disconnected => self.player_disconnected(id).await,
                ChannelEvent::Message(text) if text == "CLOSE" => {
                    let channel = self.player_left(id).await;
                    if let Some(channel) = channel {
                        channel.close().await;
                    }
                    return;
                }
                ChannelEvent::Message(text) => self.player_message(id, &text).await,
                ChannelEvent::Closed => {
                    self.player_left(id).await;
                    return;
                }
            }
        }
    }

    async fn player_connected(&self, id: u64) {
        let mut state = self.state.lock().await;
        let Some(pos) = state.waiting.iter().position(|p| p.id == id) else {
            return;
        };
        let mut player = state.waiting.remove(pos);

        let Some(Reverse(number)) = state.free_numbers.pop() else {
            // Pool exhausted between registration and connection; put the
            // player back in the waiting room rather than drop it.
            state.waiting.push(player);
            return;
        };
        player.number = Some(number);
        player.channel.send(&format!("sys.number {number}"));
        player.channel.send(&format!("ID {number}"));

        info!(identity = %self.identity, number, name = %player.name, "player connected");
        state.active.push(player);

        self.broadcast_player_list(&state);

        let tasks = tasks_payload(&state.tasks);
        let help_enabled = state.help_enabled;
        let simple_mode = state.simple_mode;
        let motor = state.motors.get(number as usize).map(|m| *m.state());

        let player = state.active.last().unwrap();
        if let Ok(json) = serde_json::to_string(&tasks) {
            player.channel.send(&format!("TaskInfo {json}"));
        }
        if let Some(motor_state) = motor {
            player.channel.send(&format!("amp {}", motor_state.amp));
            player.channel.send(&format!("freq {}", motor_state.freq));
            player.channel.send(&format!("off {}", motor_state.offset));
            player.channel.send(&format!("phb {}", motor_state.phase_shift));
        }
        player.channel.send(&format!("HelpEnabled {}", if help_enabled { "1" } else { "0" }));
        player.channel.send(&format!("SimpleMode {}", if simple_mode { "1" } else { "0" }));
    }

    async fn player_disconnected(&self, id: u64) {
        let mut state = self.state.lock().await;
        let Some(pos) = state.active.iter().position(|p| p.id == id) else {
            return;
        };
        let mut player = state.active.remove(pos);

        debug!(identity = %self.identity, number = ?player.number, name = %player.name, "player disconnected");

        if let Some(number) = player.number.take() {
            state.free_numbers.push(Reverse(number));
        }
        state.waiting.push(player);

        self.broadcast_player_list(&state);
    }

    /// Removes a player from whichever roster holds it, returning its
    /// channel handle so the caller can close it (the `"CLOSE"` dispatch
    /// path does; a plain `Closed` event has nothing left to close).
    async fn player_left(&self, id: u64) -> Option<Arc<dyn PlayerChannel>> {
        let mut state = self.state.lock().await;

        let from_active = state.active.iter().position(|p| p.id == id);
        let from_waiting = state.waiting.iter().position(|p| p.id == id);

        let mut player = if let Some(pos) = from_active {
            state.active.remove(pos)
        } else if let Some(pos) = from_waiting {
            state.waiting.remove(pos)
        } else {
            return None;
        };

        if let Some(number) = player.number.take() {
            state.free_numbers.push(Reverse(number));
        }

        if from_active.is_some() {
            self.broadcast_player_list(&state);
        }

        Some(player.channel)
    }

    async fn player_message(&self, id: u64, text: &str) {
        let mut parts = text.split_whitespace();
        if parts.next() == Some("vote") {
            let voted = parts.next().and_then(|v| v.parse::<i32>().ok()) == Some(1);
            let mut state = self.state.lock().await;
            if let Some(player) = state.active.iter_mut().find(|p| p.id == id) {
                player.voted = voted;
            }
            self.broadcast_player_list(&state);
            return;
        }

        let mut state = self.state.lock().await;
        let Some(number) = state.active.iter().find(|p| p.id == id).and_then(|p| p.number) else {
            return;
        };
        if let Some(motor) = state.motors.get_mut(number as usize) {
            motor.apply_command(text);
        }
    }

    fn broadcast_player_list(&self, state: &SessionState) {
        let summaries: Vec<PlayerSummary> = state
            .active
            .iter()
            .filter_map(|p| {
                p.number.map(|number| PlayerSummary {
                    number,
                    name: p.name.clone(),
                    voted: p.voted,
                })
            })
            .collect();

        let Ok(json) = serde_json::to_string(&summaries) else {
            return;
        };
        for player in &state.active {
            player.channel.send(&format!("PlayerInfo {json}"));
        }
    }

    fn broadcast_help_enabled(&self, state: &SessionState) {
        for player in &state.active {
            player
                .channel
                .send(&format!("HelpEnabled {}", if state.help_enabled { "1" } else { "0" }));
        }
    }

    fn broadcast_task_list(&self, state: &SessionState) {
        let payload = tasks_payload(&state.tasks);
        let Ok(json) = serde_json::to_string(&payload) else {
            return;
        };
        for player in &state.active {
            player.channel.send(&format!("TaskInfo {json}"));
        }
    }

    // ---- tick-driven write side (spec §4.4) -----------------------------

    /// Sends every dirty motor's parameters, then requests a fresh
    /// telemetry round-trip. No-op while the robot has no bound transport.
    pub async fn update(&self) {
        if !self.link.has_connection() {
            return;
        }

        let mut state = self.state.lock().await;
        for motor in state.motors.iter_mut() {
            if let Some(command) = motor.take_dirty_command() {
                self.link.write(&command);
            }
        }
        drop(state);

        self.link.write(&codec::create(Instruction::SendMotorData, &[]));
        self.link.write(&codec::create(Instruction::SendImuData, &[]));
    }

    // ---- robot-originated telemetry (spec §4.1 / §4.6) ------------------

    pub async fn handle_robot_message(&self, command: Command) {
        match command.instruction {
            Instruction::Invalid => {}
            Instruction::GetTime => {
                if let Ok(bytes) = <[u8; 4]>::try_from(command.data.as_slice()) {
                    self.state.lock().await.offset_time = u32::from_le_bytes(bytes);
                }
            }
            Instruction::SendMotorData => self.handle_motor_telemetry(&command.data).await,
            Instruction::SendImuData => self.handle_imu_telemetry(&command.data).await,
            _ => {}
        }
    }

    async fn handle_motor_telemetry(&self, data: &[u8]) {
        let Ok((motor_id, telemetry)) = motor::decode_motor_data(data) else {
            warn!(identity = %self.identity, "malformed motor telemetry");
            return;
        };

        let mut state = self.state.lock().await;
        let idx = motor_id as usize;
        if idx >= state.motors.len() {
            return;
        }

        let previous = state.motor_current[idx];
        state.motor_previous[idx] = previous;
        state.motor_current[idx] = Some(telemetry);
        state.motors[idx].ingest_telemetry(telemetry);

        if let Some(logger) = state.logger.as_mut() {
            let _ = logger.write("motor", telemetry.to_row(motor_id));
        }

        if let (Some(prev), Some(detector)) = (previous, state.sweep_detectors.get_mut(&motor_id)) {
            if detector.observe(telemetry.angle(), prev.angle()) {
                state.sweep_detectors.remove(&motor_id);
                if let Some(notify) = state.sweep_watchers.remove(&motor_id) {
                    notify.notify_one();
                }
            }
        }
    }

    async fn handle_imu_telemetry(&self, data: &[u8]) {
        let Ok(frame) = imu::decode_imu_data(data) else {
            warn!(identity = %self.identity, "malformed imu telemetry");
            return;
        };

        let mut state = self.state.lock().await;
        if let Some(logger) = state.logger.as_mut() {
            let _ = logger.writes("imu", frame.to_log_rows());
        }
    }

    // ---- admin/introspection (spec §4.9) --------------------------------

    pub async fn session_info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            robot_id: self.identity.clone(),
            names: state.active.iter().map(|p| p.name.clone()).collect(),
            help_number: state.active.iter().filter(|p| p.voted).count(),
        }
    }

    pub async fn detailed_info(&self) -> DetailedInfo {
        let state = self.state.lock().await;
        DetailedInfo {
            robot_id: self.identity.clone(),
            players: state
                .active
                .iter()
                .map(|p| DetailedPlayerInfo {
                    name: p.name.clone(),
                    help_requested: p.voted,
                })
                .collect(),
            tasks: tasks_payload(&state.tasks),
            help_enabled: state.help_enabled,
        }
    }

    pub async fn set_task(&self, task: &str, value: bool) -> bool {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(task) {
            return false;
        }
        state.tasks.insert(task.to_string(), value);
        self.broadcast_task_list(&state);
        true
    }

    pub async fn set_simple_view(&self, value: bool) {
        let mut state = self.state.lock().await;
        state.simple_mode = value;
        for player in &state.active {
            player
                .channel
                .send(&format!("SimpleMode {}", if value { "1" } else { "0" }));
        }
    }

    pub async fn set_help_enabled(&self, value: bool) {
        let mut state = self.state.lock().await;
        state.help_enabled = value;
        self.broadcast_help_enabled(&state);
    }

    /// Directly sets a motor parameter from the admin console, bypassing
    /// player attribution (spec §4.9's `freq/off/amp/phb/rev/ord` tokens).
    pub async fn admin_set_motor(&self, motor_id: u8, token: &str, value: &str) {
        let mut state = self.state.lock().await;
        if let Some(motor) = state.motors.get_mut(motor_id as usize) {
            motor.apply_command(&format!("{token} {value}"));
        }
    }

    pub async fn stop_all_motors(&self) {
        let mut state = self.state.lock().await;
        for motor in state.motors.iter_mut() {
            motor.apply_command("freq 0");
        }
    }

    pub async fn reset_all_motors(&self) {
        let mut state = self.state.lock().await;
        for motor in state.motors.iter_mut() {
            motor.apply_command("amp 0");
            motor.apply_command("freq 0");
        }
    }

    pub async fn start_log(&self) -> Result<()> {
        // The csv/filesystem work is bridged through `spawn_blocking` inside
        // `SessionLogger`; build the logger before taking the session lock
        // so that I/O never runs while it's held.
        let mut logger = SessionLogger::new(&self.log_root, &self.identity).await?;
        logger::create_standard_channels(&mut logger).await?;

        let mut state = self.state.lock().await;
        state.logger = Some(logger);
        debug!(identity = %self.identity, "session log started");
        Ok(())
    }

    pub async fn stop_log(&self) -> Result<()> {
        let logger = self.state.lock().await.logger.take();
        if let Some(mut logger) = logger {
            logger.flush().await?;
        }
        Ok(())
    }

    pub async fn log_program_row(&self, anomaly: &str, sequence: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(logger) = state.logger.as_mut() {
            logger.write("program", vec![anomaly.to_string(), sequence.to_string()])?;
        }
        Ok(())
    }

    pub async fn motor_count(&self) -> usize {
        self.state.lock().await.motors.len()
    }

    /// Closes out every player channel. Called once, from the backend's
    /// shutdown sequence.
    pub async fn close(&self) {
        let (logger, players) = {
            let mut state = self.state.lock().await;
            let players: Vec<PlayerRecord> = state.active.drain(..).chain(state.waiting.drain(..)).collect();
            (state.logger.take(), players)
        };

        if let Some(mut logger) = logger {
            let _ = logger.flush().await;
        }
        for player in players {
            player.channel.close().await;
        }
    }
}

fn tasks_payload(tasks: &BTreeMap<String, bool>) -> Vec<TaskSummary> {
    tasks
        .iter()
        .map(|(title, &value)| TaskSummary {
            title: title.clone(),
            value,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::channel::MemoryChannel;
    use crate::transport::FusedRegistry;

    fn test_session() -> Arc<Session> {
        let registry = FusedRegistry::new();
        let (link, _rising, _rx) = registry.connect(
            "robot-test",
            crate::transport::TransportKind::Udp,
            Arc::new(NullEndpoint),
        );
        Session::new(
            "robot-test".to_string(),
            link,
            3,
            PathBuf::from(std::env::temp_dir().join("edmo-backend-session-tests")),
        )
    }

    struct NullEndpoint;
    impl crate::transport::Endpoint for NullEndpoint {
        fn write(&self, _data: &[u8]) {}
    }

    #[tokio::test]
    async fn register_then_connect_assigns_lowest_free_number() {
        let session = test_session();
        let (channel, handle) = MemoryChannel::pair();
        session
            .register_player(Box::new(channel), "alice".to_string())
            .await
            .unwrap();

        handle.connect().await;
        // Let the spawned event pump observe the Connected event.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let info = session.session_info().await;
        assert_eq!(info.names, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn session_full_once_every_motor_slot_taken() {
        let session = test_session();
        let mut handles = Vec::new();
        for i in 0..3 {
            let (channel, handle) = MemoryChannel::pair();
            session
                .register_player(Box::new(channel), format!("p{i}"))
                .await
                .unwrap();
            handle.connect().await;
            handles.push(handle);
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let (channel, _handle) = MemoryChannel::pair();
        let err = session
            .register_player(Box::new(channel), "overflow".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SessionFull { .. }));
    }

    #[tokio::test]
    async fn vote_updates_player_summary_without_changing_motors() {
        let session = test_session();
        let (channel, handle) = MemoryChannel::pair();
        session
            .register_player(Box::new(channel), "bob".to_string())
            .await
            .unwrap();
        handle.connect().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        handle.deliver("vote 1").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let info = session.detailed_info().await;
        assert_eq!(info.players[0].help_requested, true);
    }

    #[tokio::test]
    async fn motor_telemetry_updates_canonical_state() {
        let session = test_session();
        let state = MotorState {
            freq: 1.0,
            amp: 2.0,
            offset: 90.0,
            phase_shift: 0.0,
            phase: 0.5,
            reverse: false,
            orders: false,
            output: 42,
        };
        let payload = motor_telemetry_payload(0, &state);
        session
            .handle_robot_message(Command {
                instruction: Instruction::SendMotorData,
                data: payload,
            })
            .await;

        assert_eq!(session.state.lock().await.motor_current[0], Some(state));
    }

    fn motor_telemetry_payload(id: u8, state: &MotorState) -> Vec<u8> {
        use byteorder::{LittleEndian, WriteBytesExt};
        let mut payload = vec![id];
        payload.write_f32::<LittleEndian>(state.freq).unwrap();
        payload.write_f32::<LittleEndian>(state.amp).unwrap();
        payload.write_f32::<LittleEndian>(state.offset).unwrap();
        payload.write_f32::<LittleEndian>(state.phase_shift).unwrap();
        payload.write_f32::<LittleEndian>(state.phase).unwrap();
        payload.write_i16::<LittleEndian>(state.reverse as i16).unwrap();
        payload.write_i16::<LittleEndian>(state.orders as i16).unwrap();
        payload.write_i32::<LittleEndian>(state.output).unwrap();
        payload
    }
}
