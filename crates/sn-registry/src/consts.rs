// SPDX-License-Identifier: AGPL-3.0-only
#![allow(dead_code)]

// Zeit- und Protokollkonstanten des Operator-Registers (v1).
// Beachte: alle Zeiten in Sekunden, alle Höhen in Blöcken.

/// frühester Abstand zwischen eigenen Heartbeats
pub const MIN_MNP_SECONDS: i64 = 10 * 60;
/// Announce-Updates desselben Operators nicht schneller annehmen
pub const MIN_MNB_SECONDS: i64 = 5 * 60;
/// ohne Heartbeat gilt der Operator als abgelaufen
pub const EXPIRATION_SECONDS: i64 = 65 * 60;
/// danach ist der Eintrag nicht mehr per Heartbeat zu retten
pub const NEW_START_REQUIRED_SECONDS: i64 = 3 * EXPIRATION_SECONDS;
/// Watchdog-Stille bis WATCHDOG_EXPIRED
pub const WATCHDOG_MAX_SECONDS: i64 = 2 * 60 * 60;
/// minimaler Abstand zwischen State-Neuberechnungen je Eintrag
pub const CHECK_SECONDS: i64 = 5;

/// Ban-Schwelle des PoSe-Scores
pub const POSE_BAN_MAX_SCORE: i32 = 5;

/// Drossel für Vollisten-Anfragen je Peer
pub const DSEG_UPDATE_SECONDS: i64 = 3 * 60 * 60;
/// Rückwärts-Scanfenster für Last-Paid-Aktualisierung
pub const LAST_PAID_SCAN_BLOCKS: i32 = 100;

/// Mindest-Protokoll für Auszahlungsteilnahme
pub const MIN_PAYMENT_PROTO_VERSION: i32 = 70206;
/// Mindest-Protokoll für PoSe-Teilnahme
pub const MIN_POSE_PROTO_VERSION: i32 = 70203;

pub const MAX_POSE_CONNECTIONS: usize = 10;
pub const MAX_POSE_RANK: usize = 10;
pub const MAX_POSE_BLOCKS: i32 = 10;

pub const MNB_RECOVERY_QUORUM_TOTAL: usize = 10;
pub const MNB_RECOVERY_QUORUM_REQUIRED: usize = 6;
pub const MNB_RECOVERY_MAX_ASK_ENTRIES: usize = 10;
pub const MNB_RECOVERY_WAIT_SECONDS: i64 = 60;
pub const MNB_RECOVERY_RETRY_SECONDS: i64 = 3 * 60 * 60;

/// Index-Rebuild nur oberhalb dieser Größe ...
pub const MAX_EXPECTED_INDEX_SIZE: usize = 30_000;
/// ... und höchstens einmal pro Stunde
pub const MIN_INDEX_REBUILD_TIME: i64 = 3600;

/// Sync-Item-Kennung für Listenantworten
pub const SYNC_ITEM_LIST: i32 = 2;
/// Sync-Item-Kennung für Auszahlungsstimmen
pub const SYNC_ITEM_PAYMENTS: i32 = 3;
