use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a dial string such as `"tcp!0.0.0.0!564"` or `"unix!/tmp/styx!0"`
/// into the protocol and the address to listen on.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    match proto {
        "tcp" => Some((proto, format!("{}:{}", addr, port))),
        "unix" => Some((proto, addr.to_owned())),
        _ => None,
    }
}
