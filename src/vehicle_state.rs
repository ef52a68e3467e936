use std::fmt;

/// Open/closed state of a door, trunk, charge port or tonneau cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureState {
    Unknown,
    Open,
    Closed,
    Ajar,
    FailedUnlatch,
    Opening,
    Closing,
}

/// Wire value to closure state, as the vehicle actually sends it. This differs from the
/// published schema (which has 0=CLOSED, 1=OPEN); firmware changes belong here only.
const CLOSURE_WIRE_VALUES: [(u64, ClosureState); 7] = [
    (0, ClosureState::Unknown),
    (1, ClosureState::Open),
    (2, ClosureState::Closed),
    (3, ClosureState::Ajar),
    (4, ClosureState::FailedUnlatch),
    (5, ClosureState::Opening),
    (6, ClosureState::Closing),
];

impl ClosureState {
    /// Values outside the table decode as `Unknown`.
    pub fn from_wire(value: u64) -> Self {
        CLOSURE_WIRE_VALUES
            .iter()
            .find(|(wire, _)| *wire == value)
            .map_or(ClosureState::Unknown, |(_, state)| *state)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClosureState::Unknown => "UNKNOWN",
            ClosureState::Open => "OPEN",
            ClosureState::Closed => "CLOSED",
            ClosureState::Ajar => "AJAR",
            ClosureState::FailedUnlatch => "FAILED_UNLATCH",
            ClosureState::Opening => "OPENING",
            ClosureState::Closing => "CLOSING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    Unlocked,
    Locked,
    InternalLocked,
    SelectiveUnlocked,
}

impl LockState {
    /// The documented lock enum. Values outside it are not a lock state.
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(LockState::Unlocked),
            1 => Some(LockState::Locked),
            2 => Some(LockState::InternalLocked),
            3 => Some(LockState::SelectiveUnlocked),
            _ => None,
        }
    }

    /// The undocumented boolean lock flag, which is inverted: 0 means locked.
    pub fn from_inverted_flag(value: u64) -> Option<Self> {
        match value {
            0 => Some(LockState::Locked),
            1 => Some(LockState::Unlocked),
            _ => None,
        }
    }

    pub fn is_locked(self) -> bool {
        matches!(self, LockState::Locked | LockState::InternalLocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockState::Unlocked => "UNLOCKED",
            LockState::Locked => "LOCKED",
            LockState::InternalLocked => "INTERNAL_LOCKED",
            LockState::SelectiveUnlocked => "SELECTIVE_UNLOCKED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SleepStatus {
    Unknown,
    Awake,
    Asleep,
}

impl SleepStatus {
    pub fn from_wire(value: u64) -> Self {
        match value {
            1 => SleepStatus::Awake,
            2 => SleepStatus::Asleep,
            _ => SleepStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SleepStatus::Unknown => "UNKNOWN",
            SleepStatus::Awake => "AWAKE",
            SleepStatus::Asleep => "ASLEEP",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserPresence {
    Unknown,
    NotPresent,
    Present,
}

impl UserPresence {
    pub fn from_wire(value: u64) -> Self {
        match value {
            1 => UserPresence::NotPresent,
            2 => UserPresence::Present,
            _ => UserPresence::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UserPresence::Unknown => "UNKNOWN",
            UserPresence::NotPresent => "NOT_PRESENT",
            UserPresence::Present => "PRESENT",
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(ClosureState, LockState, SleepStatus, UserPresence);

/// What one status response reported. `None` means the response said nothing about the
/// field, which is not the same as a reported `Unknown`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VehicleStatus {
    pub front_driver_door: Option<ClosureState>,
    pub front_passenger_door: Option<ClosureState>,
    pub rear_driver_door: Option<ClosureState>,
    pub rear_passenger_door: Option<ClosureState>,
    pub front_trunk: Option<ClosureState>,
    pub rear_trunk: Option<ClosureState>,
    pub charge_port: Option<ClosureState>,
    /// Only fitted to some models.
    pub tonneau: Option<ClosureState>,
    pub lock_state: Option<LockState>,
    pub sleep_status: Option<SleepStatus>,
    pub user_presence: Option<UserPresence>,
}

impl VehicleStatus {
    fn doors(&self) -> Option<[ClosureState; 4]> {
        Some([
            self.front_driver_door?,
            self.front_passenger_door?,
            self.rear_driver_door?,
            self.rear_passenger_door?,
        ])
    }

    /// `None` unless all four doors have been reported.
    pub fn all_doors_closed(&self) -> Option<bool> {
        self.doors().map(|doors| doors.iter().all(|d| *d == ClosureState::Closed))
    }

    /// `None` unless all four doors have been reported.
    pub fn any_doors_open(&self) -> Option<bool> {
        self.doors().map(|doors| doors.iter().any(|d| *d == ClosureState::Open))
    }

    pub fn is_locked(&self) -> Option<bool> {
        self.lock_state.map(LockState::is_locked)
    }

    fn closures(&self) -> [(StatusField, Option<ClosureState>); 8] {
        [
            (StatusField::FrontDriverDoor, self.front_driver_door),
            (StatusField::FrontPassengerDoor, self.front_passenger_door),
            (StatusField::RearDriverDoor, self.rear_driver_door),
            (StatusField::RearPassengerDoor, self.rear_passenger_door),
            (StatusField::FrontTrunk, self.front_trunk),
            (StatusField::RearTrunk, self.rear_trunk),
            (StatusField::ChargePort, self.charge_port),
            (StatusField::Tonneau, self.tonneau),
        ]
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "YES" } else { "NO" }
}

impl fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Closure Statuses:")?;
        for (field, state) in self.closures() {
            if let Some(state) = state {
                writeln!(f, "  {}: {state}", field.label())?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Vehicle Status:")?;
        if let Some(lock) = self.lock_state {
            writeln!(f, "  Lock State: {lock}")?;
        }
        if let Some(sleep) = self.sleep_status {
            writeln!(f, "  Sleep Status: {sleep}")?;
        }
        if let Some(presence) = self.user_presence {
            writeln!(f, "  User Presence: {presence}")?;
        }

        writeln!(f)?;
        write!(f, "Quick Check:")?;
        if let Some(open) = self.any_doors_open() {
            write!(f, "\n  Any Doors Open: {}", yes_no(open))?;
        }
        if let Some(closed) = self.all_doors_closed() {
            write!(f, "\n  All Doors Closed: {}", yes_no(closed))?;
        }
        if let Some(locked) = self.is_locked() {
            write!(f, "\n  Vehicle Locked: {}", yes_no(locked))?;
        }
        Ok(())
    }
}

/// The eleven tracked status fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusField {
    FrontDriverDoor,
    FrontPassengerDoor,
    RearDriverDoor,
    RearPassengerDoor,
    FrontTrunk,
    RearTrunk,
    ChargePort,
    Tonneau,
    LockState,
    SleepStatus,
    UserPresence,
}

impl StatusField {
    pub fn name(self) -> &'static str {
        match self {
            StatusField::FrontDriverDoor => "front_driver_door",
            StatusField::FrontPassengerDoor => "front_passenger_door",
            StatusField::RearDriverDoor => "rear_driver_door",
            StatusField::RearPassengerDoor => "rear_passenger_door",
            StatusField::FrontTrunk => "front_trunk",
            StatusField::RearTrunk => "rear_trunk",
            StatusField::ChargePort => "charge_port",
            StatusField::Tonneau => "tonneau",
            StatusField::LockState => "lock_state",
            StatusField::SleepStatus => "sleep_status",
            StatusField::UserPresence => "user_presence",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StatusField::FrontDriverDoor => "Front Driver Door",
            StatusField::FrontPassengerDoor => "Front Passenger Door",
            StatusField::RearDriverDoor => "Rear Driver Door",
            StatusField::RearPassengerDoor => "Rear Passenger Door",
            StatusField::FrontTrunk => "Front Trunk",
            StatusField::RearTrunk => "Rear Trunk",
            StatusField::ChargePort => "Charge Port",
            StatusField::Tonneau => "Tonneau",
            StatusField::LockState => "Lock State",
            StatusField::SleepStatus => "Sleep Status",
            StatusField::UserPresence => "User Presence",
        }
    }
}

impl fmt::Display for StatusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value held by any of the status fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusValue {
    Closure(ClosureState),
    Lock(LockState),
    Sleep(SleepStatus),
    Presence(UserPresence),
}

impl fmt::Display for StatusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusValue::Closure(v) => v.fmt(f),
            StatusValue::Lock(v) => v.fmt(f),
            StatusValue::Sleep(v) => v.fmt(f),
            StatusValue::Presence(v) => v.fmt(f),
        }
    }
}

impl From<ClosureState> for StatusValue {
    fn from(value: ClosureState) -> Self {
        StatusValue::Closure(value)
    }
}

impl From<LockState> for StatusValue {
    fn from(value: LockState) -> Self {
        StatusValue::Lock(value)
    }
}

impl From<SleepStatus> for StatusValue {
    fn from(value: SleepStatus) -> Self {
        StatusValue::Sleep(value)
    }
}

impl From<UserPresence> for StatusValue {
    fn from(value: UserPresence) -> Self {
        StatusValue::Presence(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldChange {
    pub field: StatusField,
    /// `None` when the field had never been reported before.
    pub old: Option<StatusValue>,
    pub new: StatusValue,
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.old {
            Some(old) => write!(f, "{}: {old} -> {}", self.field, self.new),
            None => write!(f, "{}: None -> {}", self.field, self.new),
        }
    }
}

/// The fields a merge actually changed. Iteration order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn get(&self, field: StatusField) -> Option<&FieldChange> {
        self.changes.iter().find(|change| change.field == field)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldChange> {
        self.changes.iter()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a FieldChange;
    type IntoIter = std::slice::Iter<'a, FieldChange>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Last known vehicle status for a session, built up from successive responses.
///
/// A field is only overwritten when a response reports it; fields a response leaves out
/// keep their previous value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VehicleState {
    current: VehicleStatus,
}

impl VehicleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `snapshot` into the accumulated state and report what changed.
    pub fn merge(&mut self, snapshot: &VehicleStatus) -> ChangeSet {
        let mut changes = Vec::new();
        let current = &mut self.current;
        merge_field(
            StatusField::FrontDriverDoor,
            &mut current.front_driver_door,
            snapshot.front_driver_door,
            &mut changes,
        );
        merge_field(
            StatusField::FrontPassengerDoor,
            &mut current.front_passenger_door,
            snapshot.front_passenger_door,
            &mut changes,
        );
        merge_field(
            StatusField::RearDriverDoor,
            &mut current.rear_driver_door,
            snapshot.rear_driver_door,
            &mut changes,
        );
        merge_field(
            StatusField::RearPassengerDoor,
            &mut current.rear_passenger_door,
            snapshot.rear_passenger_door,
            &mut changes,
        );
        merge_field(StatusField::FrontTrunk, &mut current.front_trunk, snapshot.front_trunk, &mut changes);
        merge_field(StatusField::RearTrunk, &mut current.rear_trunk, snapshot.rear_trunk, &mut changes);
        merge_field(StatusField::ChargePort, &mut current.charge_port, snapshot.charge_port, &mut changes);
        merge_field(StatusField::Tonneau, &mut current.tonneau, snapshot.tonneau, &mut changes);
        merge_field(StatusField::LockState, &mut current.lock_state, snapshot.lock_state, &mut changes);
        merge_field(StatusField::SleepStatus, &mut current.sleep_status, snapshot.sleep_status, &mut changes);
        merge_field(StatusField::UserPresence, &mut current.user_presence, snapshot.user_presence, &mut changes);
        ChangeSet { changes }
    }

    /// A copy of the accumulated status.
    pub fn snapshot(&self) -> VehicleStatus {
        self.current
    }

    pub fn status(&self) -> &VehicleStatus {
        &self.current
    }

    pub fn all_doors_closed(&self) -> Option<bool> {
        self.current.all_doors_closed()
    }

    pub fn any_doors_open(&self) -> Option<bool> {
        self.current.any_doors_open()
    }

    pub fn is_locked(&self) -> Option<bool> {
        self.current.is_locked()
    }
}

impl fmt::Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.current.fmt(f)
    }
}

fn merge_field<T>(
    field: StatusField,
    current: &mut Option<T>,
    incoming: Option<T>,
    changes: &mut Vec<FieldChange>,
) where
    T: Copy + PartialEq + Into<StatusValue>,
{
    let Some(new) = incoming else {
        return;
    };
    if *current != Some(new) {
        changes.push(FieldChange { field, old: current.map(Into::into), new: new.into() });
        *current = Some(new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fully_set() -> VehicleStatus {
        VehicleStatus {
            front_driver_door: Some(ClosureState::Closed),
            front_passenger_door: Some(ClosureState::Closed),
            rear_driver_door: Some(ClosureState::Closed),
            rear_passenger_door: Some(ClosureState::Closed),
            front_trunk: Some(ClosureState::Closed),
            rear_trunk: Some(ClosureState::Open),
            charge_port: Some(ClosureState::Closed),
            tonneau: Some(ClosureState::Closed),
            lock_state: Some(LockState::Locked),
            sleep_status: Some(SleepStatus::Asleep),
            user_presence: Some(UserPresence::NotPresent),
        }
    }

    #[test]
    fn test_closure_wire_mapping_is_inverted() {
        assert_eq!(ClosureState::from_wire(1), ClosureState::Open);
        assert_eq!(ClosureState::from_wire(2), ClosureState::Closed);
        assert_eq!(ClosureState::from_wire(42), ClosureState::Unknown);
    }

    #[test]
    fn test_lock_flag_is_inverted() {
        assert_eq!(LockState::from_inverted_flag(0), Some(LockState::Locked));
        assert_eq!(LockState::from_inverted_flag(1), Some(LockState::Unlocked));
        assert_eq!(LockState::from_inverted_flag(2), None);
        assert_eq!(LockState::from_wire(4), None);
    }

    #[test]
    fn test_first_merge_reports_every_set_field() {
        let mut state = VehicleState::new();
        let changes = state.merge(&fully_set());
        assert_eq!(changes.len(), 11);
        let lock = changes.get(StatusField::LockState).unwrap();
        assert_eq!(lock.old, None);
        assert_eq!(lock.new, StatusValue::Lock(LockState::Locked));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut state = VehicleState::new();
        state.merge(&fully_set());
        assert!(state.merge(&fully_set()).is_empty());
    }

    #[test]
    fn test_unset_fields_keep_last_known_value() {
        let mut state = VehicleState::new();
        state.merge(&fully_set());

        let partial = VehicleStatus { lock_state: Some(LockState::Unlocked), ..Default::default() };
        let changes = state.merge(&partial);

        assert_eq!(changes.len(), 1);
        let change = changes.get(StatusField::LockState).unwrap();
        assert_eq!(change.old, Some(StatusValue::Lock(LockState::Locked)));
        assert_eq!(change.to_string(), "lock_state: LOCKED -> UNLOCKED");
        assert_eq!(state.status().sleep_status, Some(SleepStatus::Asleep));
        assert_eq!(state.status().rear_trunk, Some(ClosureState::Open));
    }

    #[test]
    fn test_reported_unknown_overwrites() {
        let mut state = VehicleState::new();
        state.merge(&fully_set());
        let partial = VehicleStatus { sleep_status: Some(SleepStatus::Unknown), ..Default::default() };
        let changes = state.merge(&partial);
        assert_eq!(changes.len(), 1);
        assert_eq!(state.status().sleep_status, Some(SleepStatus::Unknown));
    }

    #[test]
    fn test_all_doors_closed_needs_all_four() {
        let status = VehicleStatus {
            front_driver_door: Some(ClosureState::Closed),
            front_passenger_door: Some(ClosureState::Closed),
            rear_driver_door: Some(ClosureState::Closed),
            ..Default::default()
        };
        assert_eq!(status.all_doors_closed(), None);
        assert_eq!(status.any_doors_open(), None);

        let status = VehicleStatus { rear_passenger_door: Some(ClosureState::Ajar), ..status };
        assert_eq!(status.all_doors_closed(), Some(false));
        assert_eq!(status.any_doors_open(), Some(false));

        let status = VehicleStatus { front_driver_door: Some(ClosureState::Open), ..status };
        assert_eq!(status.any_doors_open(), Some(true));
    }

    #[test]
    fn test_is_locked() {
        let mut status = VehicleStatus::default();
        assert_eq!(status.is_locked(), None);
        status.lock_state = Some(LockState::InternalLocked);
        assert_eq!(status.is_locked(), Some(true));
        status.lock_state = Some(LockState::SelectiveUnlocked);
        assert_eq!(status.is_locked(), Some(false));
    }

    #[test]
    fn test_display_omits_unset_fields() {
        let status = VehicleStatus {
            front_driver_door: Some(ClosureState::Open),
            lock_state: Some(LockState::Locked),
            ..Default::default()
        };
        let text = status.to_string();
        assert!(text.contains("  Front Driver Door: OPEN"));
        assert!(text.contains("  Lock State: LOCKED"));
        assert!(text.contains("  Vehicle Locked: YES"));
        assert!(!text.contains("Rear Trunk"));
        assert!(!text.contains("All Doors Closed"));
    }

    fn arb_closure() -> impl Strategy<Value = Option<ClosureState>> {
        proptest::option::of((0u64..7).prop_map(ClosureState::from_wire))
    }

    fn arb_status() -> impl Strategy<Value = VehicleStatus> {
        (
            [arb_closure(), arb_closure(), arb_closure(), arb_closure()],
            [arb_closure(), arb_closure(), arb_closure(), arb_closure()],
            proptest::option::of((0u64..4).prop_map(|v| LockState::from_wire(v).unwrap())),
            proptest::option::of((0u64..3).prop_map(SleepStatus::from_wire)),
            proptest::option::of((0u64..3).prop_map(UserPresence::from_wire)),
        )
            .prop_map(|(doors, others, lock_state, sleep_status, user_presence)| VehicleStatus {
                front_driver_door: doors[0],
                front_passenger_door: doors[1],
                rear_driver_door: doors[2],
                rear_passenger_door: doors[3],
                front_trunk: others[0],
                rear_trunk: others[1],
                charge_port: others[2],
                tonneau: others[3],
                lock_state,
                sleep_status,
                user_presence,
            })
    }

    proptest! {
        #[test]
        fn prop_empty_snapshot_changes_nothing(initial in arb_status()) {
            let mut state = VehicleState::new();
            state.merge(&initial);
            let before = state.clone();
            let changes = state.merge(&VehicleStatus::default());
            prop_assert!(changes.is_empty());
            prop_assert_eq!(state, before);
        }

        #[test]
        fn prop_merge_never_unsets(initial in arb_status(), incoming in arb_status()) {
            let mut state = VehicleState::new();
            state.merge(&initial);
            let changes = state.merge(&incoming);
            let merged = state.snapshot();
            prop_assert!(
                merged.lock_state.is_some() || (initial.lock_state.is_none() && incoming.lock_state.is_none())
            );
            prop_assert!(changes.len() <= 11);
            prop_assert!(state.merge(&incoming).is_empty());
        }
    }
}
