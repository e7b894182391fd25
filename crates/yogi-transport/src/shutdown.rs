/// Which half of a bidirectional byte stream to shut down. Wraps
/// `std::net::Shutdown` at the `ByteTransport` contract boundary, used
/// by `TcpByteTransport::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Write,
    Read,
    Both,
}
