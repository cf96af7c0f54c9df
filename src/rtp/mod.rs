/// RTP socket reader that routes packets to the video and audio sinks of a stream.
pub mod demuxer;
/// RTP header validation ahead of the sinks.
pub mod packet;
