//! Filter expression parser using nom
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr      := and_expr (("or" | "||") and_expr)*
//! and_expr  := unary (("and" | "&&") unary)*
//! unary     := ("not" | "!") unary | "(" expr ")" | primitive
//! primitive := "ether" [dir] "host" MAC
//!            | "vlan" [N] | "less" N | "greater" N
//!            | [proto] [dir] ("host" ADDR | "net" CIDR | "port" N | "portrange" N-N)
//!            | [proto] "proto" (N | name)
//!            | proto
//! dir       := "src or dst" | "src and dst" | "src" | "dst"
//! ```
//!
//! A protocol qualifier in front of a primitive is the same as
//! `proto and primitive`.

use super::program::{Dir, Expr, Primitive, Proto};
use ipnetwork::IpNetwork;
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{all_consuming, map, map_res, not, opt, peek, value},
    multi::many0,
    sequence::{delimited, pair, preceded, separated_pair, terminated, tuple},
    IResult,
};
use sensor_common::frame::{IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP};
use sensor_common::MacAddr;
use std::net::IpAddr;

/// Parse a whole expression; the error carries the unparsed remainder
pub fn parse_expression(input: &str) -> Result<Expr, String> {
    if input.trim().is_empty() {
        return Ok(Expr::All);
    }
    match all_consuming(delimited(multispace0, expr, multispace0))(input) {
        Ok((_, e)) => Ok(e),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(format!("syntax error near '{}'", e.input.trim()))
        }
        Err(nom::Err::Incomplete(_)) => Err("incomplete expression".into()),
    }
}

/// Keyword that must not run into a following identifier character
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(
        tag_no_case(kw),
        not(peek(nom::character::complete::satisfy(|c| {
            c.is_ascii_alphanumeric() || c == '_'
        }))),
    )
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(alt((keyword("or"), tag("||")))), and_expr))(input)?;
    Ok((input, rest.into_iter().fold(first, Expr::or)))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(preceded(ws(alt((keyword("and"), tag("&&")))), unary))(input)?;
    Ok((input, rest.into_iter().fold(first, Expr::and)))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(
            preceded(alt((terminated(keyword("not"), multispace0), terminated(tag("!"), multispace0))), unary),
            |e| Expr::Not(Box::new(e)),
        ),
        delimited(terminated(char('('), multispace0), expr, preceded(multispace0, char(')'))),
        primitive,
    ))(input)
}

fn number<T: std::str::FromStr>(input: &str) -> IResult<&str, T> {
    map_res(digit1, str::parse)(input)
}

/// Address-ish token: hex digits, dots, colons, slash
fn addr_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_hexdigit() || c == '.' || c == ':' || c == '/' || c == '-')(input)
}

fn dir(input: &str) -> IResult<&str, Dir> {
    terminated(
        alt((
            value(Dir::Either, tuple((keyword("src"), multispace1, keyword("or"), multispace1, keyword("dst")))),
            value(Dir::Both, tuple((keyword("src"), multispace1, keyword("and"), multispace1, keyword("dst")))),
            value(Dir::Src, keyword("src")),
            value(Dir::Dst, keyword("dst")),
        )),
        multispace1,
    )(input)
}

fn proto(input: &str) -> IResult<&str, Proto> {
    alt((
        value(Proto::Ether, keyword("ether")),
        value(Proto::Ip6, keyword("ip6")),
        value(Proto::Ip, keyword("ip")),
        value(Proto::Arp, keyword("arp")),
        value(Proto::Tcp, keyword("tcp")),
        value(Proto::Udp, keyword("udp")),
        value(Proto::Sctp, keyword("sctp")),
        value(Proto::Icmp6, keyword("icmp6")),
        value(Proto::Icmp, keyword("icmp")),
    ))(input)
}

fn proto_number(input: &str) -> IResult<&str, u8> {
    alt((
        number,
        value(IPPROTO_TCP, keyword("tcp")),
        value(IPPROTO_UDP, keyword("udp")),
        value(IPPROTO_SCTP, keyword("sctp")),
        value(IPPROTO_ICMPV6, keyword("icmp6")),
        value(IPPROTO_ICMP, keyword("icmp")),
    ))(input)
}

fn host(input: &str) -> IResult<&str, Primitive> {
    let (input, dir) = opt(dir)(input)?;
    let (input, addr) = preceded(pair(keyword("host"), multispace1), map_res(addr_token, str::parse::<IpAddr>))(input)?;
    Ok((input, Primitive::Host(dir.unwrap_or(Dir::Either), addr)))
}

fn net(input: &str) -> IResult<&str, Primitive> {
    let (input, dir) = opt(dir)(input)?;
    let (input, network) = preceded(pair(keyword("net"), multispace1), map_res(addr_token, parse_network))(input)?;
    Ok((input, Primitive::Net(dir.unwrap_or(Dir::Either), network)))
}

/// CIDR with host bits cleared; a bare address is a full-length prefix
fn parse_network(s: &str) -> Result<IpNetwork, ipnetwork::IpNetworkError> {
    let net: IpNetwork = s.parse()?;
    IpNetwork::new(net.network(), net.prefix())
}

fn port(input: &str) -> IResult<&str, Primitive> {
    let (input, dir) = opt(dir)(input)?;
    let dir = dir.unwrap_or(Dir::Either);
    alt((
        map(
            preceded(
                pair(keyword("portrange"), multispace1),
                separated_pair(number::<u16>, char('-'), number::<u16>),
            ),
            move |(lo, hi)| Primitive::PortRange(dir, lo.min(hi), lo.max(hi)),
        ),
        map(preceded(pair(keyword("port"), multispace1), number::<u16>), move |p| {
            Primitive::PortRange(dir, p, p)
        }),
    ))(input)
}

fn ip_proto(input: &str) -> IResult<&str, Primitive> {
    map(preceded(pair(keyword("proto"), multispace1), proto_number), Primitive::IpProto)(input)
}

fn qualified(input: &str) -> IResult<&str, Primitive> {
    alt((host, net, port, ip_proto))(input)
}

fn ether_host(input: &str) -> IResult<&str, Primitive> {
    let (input, _) = pair(keyword("ether"), multispace1)(input)?;
    let (input, dir) = opt(dir)(input)?;
    let (input, mac) = preceded(pair(keyword("host"), multispace1), map_res(addr_token, str::parse::<MacAddr>))(input)?;
    Ok((input, Primitive::EtherHost(dir.unwrap_or(Dir::Either), mac)))
}

fn primitive(input: &str) -> IResult<&str, Expr> {
    alt((
        map(ether_host, Expr::Prim),
        map(preceded(keyword("vlan"), opt(preceded(multispace1, number::<u16>))), |id| {
            Expr::Prim(Primitive::Vlan(id))
        }),
        map(preceded(pair(keyword("less"), multispace1), number::<usize>), |n| {
            Expr::Prim(Primitive::Less(n))
        }),
        map(preceded(pair(keyword("greater"), multispace1), number::<usize>), |n| {
            Expr::Prim(Primitive::Greater(n))
        }),
        map(separated_pair(proto, multispace1, qualified), |(p, prim)| {
            Expr::and(Expr::Prim(Primitive::Proto(p)), Expr::Prim(prim))
        }),
        map(qualified, Expr::Prim),
        map(proto, |p| Expr::Prim(Primitive::Proto(p))),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qualified_port() {
        let e = parse_expression("tcp port 80").unwrap();
        assert_eq!(
            e,
            Expr::and(
                Expr::Prim(Primitive::Proto(Proto::Tcp)),
                Expr::Prim(Primitive::PortRange(Dir::Either, 80, 80)),
            )
        );
    }

    #[test]
    fn test_precedence() {
        // not > and > or
        let e = parse_expression("not udp and tcp or arp").unwrap();
        match e {
            Expr::Or(lhs, rhs) => {
                assert!(matches!(*lhs, Expr::And(_, _)));
                assert_eq!(*rhs, Expr::Prim(Primitive::Proto(Proto::Arp)));
            }
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn test_parse_directions_and_nets() {
        assert!(matches!(
            parse_expression("src net 10.1.2.3/8").unwrap(),
            Expr::Prim(Primitive::Net(Dir::Src, n)) if n.to_string() == "10.0.0.0/8"
        ));
        assert!(matches!(
            parse_expression("src and dst host 10.0.0.1").unwrap(),
            Expr::Prim(Primitive::Host(Dir::Both, _))
        ));
        assert!(matches!(
            parse_expression("ether dst host ff:ff:ff:ff:ff:ff").unwrap(),
            Expr::Prim(Primitive::EtherHost(Dir::Dst, _))
        ));
        assert!(parse_expression("ip6 host ::1 && !(portrange 1000-2000 || vlan 12)").is_ok());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("tcp port").is_err());
        assert!(parse_expression("host 999.1.1.1").is_err());
        assert!(parse_expression("(tcp").is_err());
        assert!(parse_expression("tcpx").is_err());
        assert!(parse_expression("tcp port 80 garbage").is_err());
    }

    #[test]
    fn test_empty_matches_all() {
        assert_eq!(parse_expression("  ").unwrap(), Expr::All);
    }
}
