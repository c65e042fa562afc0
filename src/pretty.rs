use crate::span::{Span, Spanned};
use crate::tree::*;

/// Render a bound operation into a canonical source-like form, assigning
/// each node's span into the rendered text as it is emitted. Diagnostics
/// use these spans for labeled reports.
pub fn render(op: &mut BoundOperation) {
    let mut pp = PrettyPrinter::new(&op.locals);
    let start = pp.pos();
    let receiver = op.receiver.clone();
    pp.emit_kind(&receiver, &mut op.kind.node);
    op.kind.span = Span::new(start, pp.pos());
    op.rendered = pp.buf;
}

struct PrettyPrinter {
    buf: String,
    local_names: Vec<String>,
}

impl PrettyPrinter {
    fn new(locals: &[LocalDecl]) -> Self {
        Self {
            buf: String::new(),
            local_names: locals.iter().map(|l| l.name.clone()).collect(),
        }
    }

    fn pos(&self) -> usize {
        self.buf.len()
    }

    fn write(&mut self, s: &str) {
        self.buf.push_str(s);
    }

    fn local(&mut self, id: LocalId) {
        // An out-of-range id still renders; validation rejects it later
        // with a span into this text.
        let name = self
            .local_names
            .get(id.0 as usize)
            .cloned()
            .unwrap_or_else(|| format!("local{}", id.0));
        self.write(&name);
    }

    fn emit_kind(&mut self, receiver: &ReceiverVar, kind: &mut OperationKind) {
        match kind {
            OperationKind::Call { member, args, conditional } => {
                self.local(receiver.local);
                self.write(if *conditional { "?." } else { "." });
                self.write(member);
                self.write("(");
                let count = args.len();
                for (i, arg) in args.iter_mut().enumerate() {
                    self.emit_expr(arg);
                    if i + 1 < count {
                        self.write(", ");
                    }
                }
                self.write(")");
            }
            OperationKind::PropertyCompound { property, op, rhs } => {
                self.local(receiver.local);
                self.write(".");
                self.write(property);
                self.write(match op {
                    BinOp::Add => " += ",
                    BinOp::Sub => " -= ",
                });
                self.emit_expr(rhs);
            }
            OperationKind::PropertyCoalesce { property, rhs } => {
                self.local(receiver.local);
                self.write(".");
                self.write(property);
                self.write(" ??= ");
                self.emit_expr(rhs);
            }
            OperationKind::IndexerCompound { index, op, rhs } => {
                self.local(receiver.local);
                self.write("[");
                self.emit_expr(index);
                self.write("]");
                self.write(match op {
                    BinOp::Add => " += ",
                    BinOp::Sub => " -= ",
                });
                self.emit_expr(rhs);
            }
            OperationKind::IndexerCoalesce { index, rhs } => {
                self.local(receiver.local);
                self.write("[");
                self.emit_expr(index);
                self.write("] ??= ");
                self.emit_expr(rhs);
            }
        }
    }

    fn emit_expr(&mut self, expr: &mut Spanned<Expr>) {
        let start = self.pos();
        match &mut expr.node {
            Expr::Int(value) => {
                let text = value.to_string();
                self.write(&text);
            }
            Expr::Str(value) => {
                let text = format!("\"{value}\"");
                self.write(&text);
            }
            Expr::Local(id) => {
                self.local(*id);
            }
            Expr::Helper { name, args, .. } => {
                let name = name.clone();
                self.write(&name);
                self.write("(");
                let count = args.len();
                for (i, arg) in args.iter_mut().enumerate() {
                    let arg_start = self.pos();
                    match &mut arg.node {
                        HelperArg::Value(inner) => self.emit_expr(inner),
                        HelperArg::Ref(local) => {
                            self.write("ref ");
                            self.local(*local);
                        }
                    }
                    arg.span = Span::new(arg_start, self.pos());
                    if i + 1 < count {
                        self.write(", ");
                    }
                }
                self.write(")");
            }
            Expr::Await(inner) => {
                self.write("await ");
                self.emit_expr(inner);
            }
        }
        expr.span = Span::new(start, self.pos());
    }
}
