#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SharedError {
    #[error("Invalid room id '{nsp_room_id}': expected '<appPid>:<room>'")]
    InvalidRoomId { nsp_room_id: String },

    #[error("Invalid instance id: {0}")]
    InvalidInstanceId(String),
}
